//! Serializable types shared by the session manager and the MCP tools.
//!
//! Everything here implements `Serialize`, `Deserialize`, and `JsonSchema` so it can be
//! returned as structured MCP content. Unsigned fields use [`crate::mcp::schema::uint`] so
//! the generated schema stays free of Rust-specific formats.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::mcp::llm::ChatMessage;

/// Lifecycle status of a session.
///
/// Transitions are monotonic except `connected -> disconnected | error`.
/// A `closed` session is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Transport task is establishing the connection
    Connecting,
    /// Interactive shell is open
    Connected,
    /// Remote shell exited
    Disconnected,
    /// Connection or I/O failure (see `last_error` / `error_kind`)
    Error,
    /// Closed by the caller or the reaper
    Closed,
}

impl SessionStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Connecting, Connected | Disconnected | Error | Closed) => true,
            (Connected, Disconnected | Error | Closed) => true,
            (Disconnected | Error, Closed) => true,
            _ => false,
        }
    }

    /// Statuses the reaper treats as dead.
    pub fn is_dead(self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// State of the most recently dispatched command, as tracked by the decision loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    #[default]
    Idle,
    Running,
    Error,
    WaitingForResponse,
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandState::Idle => write!(f, "idle"),
            CommandState::Running => write!(f, "running"),
            CommandState::Error => write!(f, "error"),
            CommandState::WaitingForResponse => write!(f, "waiting_for_response"),
        }
    }
}

/// Classification of a fatal connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Network,
    Timeout,
    Protocol,
}

/// Best-effort guess of the remote operating system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OsFingerprint {
    pub os_type: String,
    pub version: String,
}

pub const UNKNOWN: &str = "Unknown";

impl Default for OsFingerprint {
    fn default() -> Self {
        Self {
            os_type: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
        }
    }
}

impl OsFingerprint {
    pub fn is_known(&self) -> bool {
        self.os_type != UNKNOWN
    }

    /// Fold a new observation in. Known values are never replaced, and a version is
    /// only taken from an observation of the same OS type. Returns `true` if anything
    /// changed.
    pub fn merge(&mut self, observed: &OsFingerprint) -> bool {
        if observed.os_type == UNKNOWN {
            return false;
        }
        if self.os_type == UNKNOWN {
            *self = observed.clone();
            return true;
        }
        if self.os_type == observed.os_type
            && self.version == UNKNOWN
            && observed.version != UNKNOWN
        {
            self.version = observed.version.clone();
            return true;
        }
        false
    }
}

impl std::fmt::Display for OsFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.os_type, self.version)
    }
}

/// Progress counter published by the decision loop.
///
/// `finished` counts commands that ran to a prompt return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandProgress {
    pub state: CommandState,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub finished: u64,
}

/// Snapshot returned by `get_session_status`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionStatusRecord {
    pub session_id: String,
    pub status: SessionStatus,
    pub host: String,
    pub username: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Seconds since the session was created
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub uptime_secs: u64,
    /// Seconds since the last inbound or outbound activity
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub idle_secs: u64,
    pub os_fingerprint: OsFingerprint,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub commands_count: usize,
    pub command_state: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    /// Error lines extracted from the last failing command or connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// One line of `list_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionSummary {
    pub session_id: String,
    pub host: String,
    pub username: String,
    pub status: SessionStatus,
    pub command_state: CommandState,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub message: String,
}

/// Result of a one-shot command run on a throwaway session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandRunResponse {
    pub host: String,
    pub username: String,
    pub command: String,
    /// `error` when the output looked like a failure
    pub state: CommandState,
    /// What the shell printed from the command echo up to the returning prompt
    pub output: String,
    pub os_fingerprint: OsFingerprint,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionOutputResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub command_state: CommandState,
    pub output: String,
    /// Pass this back as `since` to read only newer output
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionContextResponse {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
}

/// Outcome of the reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReapReport {
    /// Connected sessions closed for being idle too long
    pub closed: Vec<String>,
    /// Dead sessions removed from the registry
    pub purged: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.purged.is_empty()
    }
}

/// Final status of a planned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Every step returned to the shell prompt without an error
    Completed,
    /// A step failed or could not be sent
    Failed,
    /// A step did not finish within the step timeout
    TimedOut,
    /// Planned and handed to a background runner
    Started,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepOutcome {
    pub command: String,
    pub state: CommandState,
    pub output: String,
}

/// Result of `TaskPlanner::execute`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskReport {
    pub task_id: String,
    pub session_id: String,
    pub task: String,
    pub planned: Vec<String>,
    pub steps: Vec<StepOutcome>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod session_status {
        use super::*;

        #[test]
        fn test_connecting_can_reach_every_other_status() {
            for next in [
                SessionStatus::Connected,
                SessionStatus::Disconnected,
                SessionStatus::Error,
                SessionStatus::Closed,
            ] {
                assert!(SessionStatus::Connecting.can_transition_to(next));
            }
        }

        #[test]
        fn test_closed_is_final() {
            for next in [
                SessionStatus::Connecting,
                SessionStatus::Connected,
                SessionStatus::Disconnected,
                SessionStatus::Error,
                SessionStatus::Closed,
            ] {
                assert!(!SessionStatus::Closed.can_transition_to(next));
            }
        }

        #[test]
        fn test_dead_sessions_cannot_reconnect() {
            assert!(!SessionStatus::Error.can_transition_to(SessionStatus::Connected));
            assert!(!SessionStatus::Disconnected.can_transition_to(SessionStatus::Connected));
            assert!(!SessionStatus::Error.can_transition_to(SessionStatus::Disconnected));
        }

        #[test]
        fn test_display_matches_serde() {
            for status in [
                SessionStatus::Connecting,
                SessionStatus::Connected,
                SessionStatus::Disconnected,
                SessionStatus::Error,
                SessionStatus::Closed,
            ] {
                let json = serde_json::to_string(&status).unwrap();
                assert_eq!(json, format!("\"{}\"", status));
            }
        }
    }

    mod command_state {
        use super::*;

        #[test]
        fn test_default_is_idle() {
            assert_eq!(CommandState::default(), CommandState::Idle);
        }

        #[test]
        fn test_waiting_serializes_snake_case() {
            let json = serde_json::to_string(&CommandState::WaitingForResponse).unwrap();
            assert_eq!(json, "\"waiting_for_response\"");
        }
    }

    mod os_fingerprint {
        use super::*;

        #[test]
        fn test_merge_fills_unknown_fields() {
            let mut fp = OsFingerprint::default();
            let changed = fp.merge(&OsFingerprint {
                os_type: "Ubuntu".to_string(),
                version: "5.15.0".to_string(),
            });
            assert!(changed);
            assert_eq!(fp.os_type, "Ubuntu");
            assert_eq!(fp.version, "5.15.0");
        }

        #[test]
        fn test_unknown_never_overwrites_known() {
            let mut fp = OsFingerprint {
                os_type: "Debian".to_string(),
                version: "6.1.0".to_string(),
            };
            assert!(!fp.merge(&OsFingerprint::default()));
            assert_eq!(fp.os_type, "Debian");
            assert_eq!(fp.version, "6.1.0");
        }

        #[test]
        fn test_known_type_is_write_once() {
            let mut fp = OsFingerprint {
                os_type: "Linux".to_string(),
                version: UNKNOWN.to_string(),
            };
            assert!(!fp.merge(&OsFingerprint {
                os_type: "Windows".to_string(),
                version: "10.0.1".to_string(),
            }));
            assert_eq!(fp.os_type, "Linux");
            assert_eq!(fp.version, UNKNOWN);
        }

        #[test]
        fn test_version_comes_from_matching_type() {
            let mut fp = OsFingerprint {
                os_type: "Ubuntu".to_string(),
                version: UNKNOWN.to_string(),
            };
            assert!(fp.merge(&OsFingerprint {
                os_type: "Ubuntu".to_string(),
                version: "22.04.3".to_string(),
            }));
            assert_eq!(fp.version, "22.04.3");
        }

        #[test]
        fn test_version_without_type_is_ignored() {
            let mut fp = OsFingerprint::default();
            assert!(!fp.merge(&OsFingerprint {
                os_type: UNKNOWN.to_string(),
                version: "10.0.19045".to_string(),
            }));
            assert_eq!(fp, OsFingerprint::default());
        }
    }

    mod response_serialization {
        use super::*;

        #[test]
        fn test_status_record_skips_empty_optionals() {
            let now = Utc::now();
            let record = SessionStatusRecord {
                session_id: "u@h_1_1234".to_string(),
                status: SessionStatus::Connected,
                host: "h".to_string(),
                username: "u".to_string(),
                start_time: now,
                last_activity: now,
                uptime_secs: 3,
                idle_secs: 1,
                os_fingerprint: OsFingerprint::default(),
                commands_count: 0,
                command_state: CommandState::Idle,
                current_command: None,
                last_error: None,
                error_kind: None,
            };
            let json = serde_json::to_value(&record).unwrap();
            assert!(json.get("last_error").is_none());
            assert!(json.get("error_kind").is_none());
            assert_eq!(json["status"], "connected");
            assert_eq!(json["os_fingerprint"]["os_type"], "Unknown");
        }

        #[test]
        fn test_reap_report_is_empty() {
            assert!(ReapReport::default().is_empty());
            let report = ReapReport {
                closed: vec!["a".to_string()],
                purged: vec![],
            };
            assert!(!report.is_empty());
        }
    }
}
