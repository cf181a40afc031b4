//! Configuration resolution for the session manager.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 15s | Connect and authenticate bound |
//! | `SSH_POLL_INTERVAL_MS` | 100ms | Transport read poll interval |
//! | `SSH_BANNER_WAIT_MS` | 1000ms | Window for draining the login banner |
//! | `SSH_IDLE_TIMEOUT` | 14400s | Connected sessions idle longer are closed by the reaper |
//! | `SSH_ZOMBIE_TIMEOUT` | 3600s | Dead sessions older than this are purged by the reaper |
//! | `SSH_REAPER_INTERVAL` | 60s | Reaper tick |
//! | `SSH_JOIN_TIMEOUT` | 5s | How long `close_session` waits for each task |
//! | `SSH_HISTORY_MAX_ENTRIES` | 1000 | Output history cap per session |
//! | `SSH_STEP_TIMEOUT` | 300s | Task planner per-step bound |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `LLM_API_KEY` | unset | Enables the LLM collaborator |
//! | `LLM_BASE_URL` | `https://api.deepseek.com` | OpenAI-compatible endpoint |
//! | `LLM_MODEL` | `deepseek-chat` | Model name |
//! | `LLM_TIMEOUT` | 20s | Per-call bound |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub(crate) const DEFAULT_BANNER_WAIT_MS: u64 = 1000;
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 4 * 60 * 60;
pub(crate) const DEFAULT_ZOMBIE_TIMEOUT_SECS: u64 = 60 * 60;
pub(crate) const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 5;
pub(crate) const DEFAULT_HISTORY_MAX_ENTRIES: usize = 1000;
pub(crate) const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;
pub(crate) const DEFAULT_LLM_TIMEOUT_SECS: u64 = 20;
pub(crate) const DEFAULT_LLM_BASE_URL: &str = "https://api.deepseek.com";
pub(crate) const DEFAULT_LLM_MODEL: &str = "deepseek-chat";

/// Default maximum retry attempts for planner LLM calls
pub(crate) const DEFAULT_LLM_MAX_RETRIES: usize = 2;

/// Maximum retry delay cap (10 seconds)
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const POLL_INTERVAL_MS_ENV_VAR: &str = "SSH_POLL_INTERVAL_MS";
pub(crate) const BANNER_WAIT_MS_ENV_VAR: &str = "SSH_BANNER_WAIT_MS";
pub(crate) const IDLE_TIMEOUT_ENV_VAR: &str = "SSH_IDLE_TIMEOUT";
pub(crate) const ZOMBIE_TIMEOUT_ENV_VAR: &str = "SSH_ZOMBIE_TIMEOUT";
pub(crate) const REAPER_INTERVAL_ENV_VAR: &str = "SSH_REAPER_INTERVAL";
pub(crate) const JOIN_TIMEOUT_ENV_VAR: &str = "SSH_JOIN_TIMEOUT";
pub(crate) const HISTORY_MAX_ENTRIES_ENV_VAR: &str = "SSH_HISTORY_MAX_ENTRIES";
pub(crate) const STEP_TIMEOUT_ENV_VAR: &str = "SSH_STEP_TIMEOUT";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const LLM_API_KEY_ENV_VAR: &str = "LLM_API_KEY";
pub(crate) const LLM_BASE_URL_ENV_VAR: &str = "LLM_BASE_URL";
pub(crate) const LLM_MODEL_ENV_VAR: &str = "LLM_MODEL";
pub(crate) const LLM_TIMEOUT_ENV_VAR: &str = "LLM_TIMEOUT";

/// Resolve a parseable value with priority: parameter -> env var -> default.
///
/// Unparseable environment values fall through to the default.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

/// Resolve the connection timeout (seconds) with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_poll_interval(interval_ms: Option<u64>) -> Duration {
    // Zero would turn the transport loop into a busy spin
    Duration::from_millis(
        resolve(interval_ms, POLL_INTERVAL_MS_ENV_VAR, DEFAULT_POLL_INTERVAL_MS).max(1),
    )
}

pub(crate) fn resolve_banner_wait(wait_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve(wait_ms, BANNER_WAIT_MS_ENV_VAR, DEFAULT_BANNER_WAIT_MS))
}

pub(crate) fn resolve_idle_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        IDLE_TIMEOUT_ENV_VAR,
        DEFAULT_IDLE_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_zombie_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        ZOMBIE_TIMEOUT_ENV_VAR,
        DEFAULT_ZOMBIE_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_reaper_interval(interval_param: Option<u64>) -> Duration {
    Duration::from_secs(
        resolve(
            interval_param,
            REAPER_INTERVAL_ENV_VAR,
            DEFAULT_REAPER_INTERVAL_SECS,
        )
        .max(1),
    )
}

pub(crate) fn resolve_join_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        JOIN_TIMEOUT_ENV_VAR,
        DEFAULT_JOIN_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_history_max_entries(max_param: Option<usize>) -> usize {
    // The trim keeps half the cap, so anything below 2 would discard every chunk
    resolve(
        max_param,
        HISTORY_MAX_ENTRIES_ENV_VAR,
        DEFAULT_HISTORY_MAX_ENTRIES,
    )
    .max(2)
}

pub(crate) fn resolve_step_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        STEP_TIMEOUT_ENV_VAR,
        DEFAULT_STEP_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_llm_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        LLM_TIMEOUT_ENV_VAR,
        DEFAULT_LLM_TIMEOUT_SECS,
    ))
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Timeouts and limits for the session manager and its per-session tasks.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub banner_wait: Duration,
    pub idle_timeout: Duration,
    pub zombie_timeout: Duration,
    pub reaper_interval: Duration,
    pub join_timeout: Duration,
    pub history_max_entries: usize,
    pub step_timeout: Duration,
    pub llm_timeout: Duration,
}

impl ManagerConfig {
    /// Build the configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            poll_interval: resolve_poll_interval(None),
            banner_wait: resolve_banner_wait(None),
            idle_timeout: resolve_idle_timeout(None),
            zombie_timeout: resolve_zombie_timeout(None),
            reaper_interval: resolve_reaper_interval(None),
            join_timeout: resolve_join_timeout(None),
            history_max_entries: resolve_history_max_entries(None),
            step_timeout: resolve_step_timeout(None),
            llm_timeout: resolve_llm_timeout(None),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            banner_wait: Duration::from_millis(DEFAULT_BANNER_WAIT_MS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            zombie_timeout: Duration::from_secs(DEFAULT_ZOMBIE_TIMEOUT_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
            history_max_entries: DEFAULT_HISTORY_MAX_ENTRIES,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            llm_timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
        }
    }
}

/// Connection settings for the OpenAI-compatible LLM endpoint.
#[derive(Debug)]
pub struct LlmSettings {
    /// `None` disables the collaborator; suggestions fall back to canned answers.
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl LlmSettings {
    pub fn from_env() -> Self {
        let api_key = env::var(LLM_API_KEY_ENV_VAR)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .map(SecretString::from);

        Self {
            api_key,
            base_url: env::var(LLM_BASE_URL_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_LLM_BASE_URL.to_string()),
            model: env::var(LLM_MODEL_ENV_VAR).unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            timeout: resolve_llm_timeout(None),
        }
    }
}
