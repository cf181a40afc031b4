//! Session records and the russh client handler.
//!
//! # Architecture
//!
//! - [`SessionRecord`]: everything the manager knows about one session. Written by the
//!   transport task (status, output history, activity), by the decision loop (OS
//!   fingerprint, command state, escalations), and by the manager (command history).
//!   Records outlive their tasks so output stays readable after `close_session`.
//! - [`OutputHistory`]: bounded, timestamped log of decoded output chunks.
//! - [`MessageContext`]: bounded list of messages the decision loop escalates to the
//!   orchestrating model (errors it could not handle, remediation hints).
//! - `SshClientHandler`: a russh client handler that accepts all host keys (similar to
//!   `StrictHostKeyChecking=no` in OpenSSH).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rand::Rng;
use russh::{client, keys};
use secrecy::SecretString;
use std::sync::Arc;

use crate::mcp::llm::ChatMessage;
use crate::mcp::types::{
    CommandState, ErrorKind, OsFingerprint, SessionStatus, SessionStatusRecord, SessionSummary,
};

/// Maximum number of escalation messages kept per session
pub const MESSAGE_CONTEXT_LIMIT: usize = 50;

/// Client handler for russh that accepts all host keys.
///
/// # Security Note
///
/// Host keys are not verified. Deployments that need protection against
/// man-in-the-middle attacks should check against a known_hosts file here.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build a session id of the form `{username}@{host}_{unix_ts}_{rand}`.
pub fn generate_session_id(username: &str, host: &str, now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(1000..=9999);
    format!("{}@{}_{}_{}", username, host, now.timestamp(), suffix)
}

/// One decoded chunk of output.
#[derive(Debug, Clone)]
pub struct OutputEntry {
    pub timestamp: DateTime<Utc>,
    pub chunk: String,
}

/// Bounded output log. On overflow the oldest half is dropped.
#[derive(Debug)]
pub struct OutputHistory {
    entries: Vec<OutputEntry>,
    max_entries: usize,
}

impl OutputHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries: max_entries.max(2),
        }
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, chunk: impl Into<String>) {
        self.entries.push(OutputEntry {
            timestamp,
            chunk: chunk.into(),
        });
        if self.entries.len() > self.max_entries {
            let keep = self.max_entries / 2;
            let drop = self.entries.len() - keep;
            self.entries.drain(..drop);
        }
    }

    /// Concatenate chunks newer than `since` (all chunks when `None`).
    pub fn since(&self, since: Option<DateTime<Utc>>) -> String {
        self.entries
            .iter()
            .filter(|entry| since.is_none_or(|t| entry.timestamp > t))
            .map(|entry| entry.chunk.as_str())
            .collect()
    }

    /// Timestamp of the newest chunk.
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|entry| entry.timestamp)
    }

    /// The last `max_chars` characters of the full history.
    pub fn tail(&self, max_chars: usize) -> String {
        let all = self.since(None);
        let count = all.chars().count();
        all.chars().skip(count.saturating_sub(max_chars)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Messages escalated by the decision loop, oldest first.
#[derive(Debug, Default)]
pub struct MessageContext {
    messages: VecDeque<ChatMessage>,
}

impl MessageContext {
    pub fn push(&mut self, message: ChatMessage) {
        if self.messages.len() == MESSAGE_CONTEXT_LIMIT {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Everything known about one session.
#[derive(Debug)]
pub struct SessionRecord {
    pub session_id: String,
    pub host: String,
    pub username: String,
    password: Arc<SecretString>,
    status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub commands_history: Vec<String>,
    os_fingerprint: OsFingerprint,
    pub command_state: CommandState,
    pub current_command: Option<String>,
    pub commands_finished: u64,
    /// Output of the most recently finished command, echo through prompt
    pub last_command_output: Option<String>,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub output: OutputHistory,
    pub context: MessageContext,
}

impl SessionRecord {
    pub fn new(
        session_id: String,
        host: String,
        username: String,
        password: Arc<SecretString>,
        history_max_entries: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            host,
            username,
            password,
            status: SessionStatus::Connecting,
            start_time: now,
            last_activity: now,
            commands_history: Vec::new(),
            os_fingerprint: OsFingerprint::default(),
            command_state: CommandState::Idle,
            current_command: None,
            commands_finished: 0,
            last_command_output: None,
            last_error: None,
            error_kind: None,
            output: OutputHistory::new(history_max_entries),
            context: MessageContext::default(),
        }
    }

    pub fn password(&self) -> Arc<SecretString> {
        self.password.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Apply a status change if the transition is legal. Returns `true` on change.
    pub fn set_status(&mut self, next: SessionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn os_fingerprint(&self) -> &OsFingerprint {
        &self.os_fingerprint
    }

    /// Merge an OS observation; known values are never overwritten.
    pub fn record_os(&mut self, observed: &OsFingerprint) -> bool {
        self.os_fingerprint.merge(observed)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Append output and count it as activity.
    pub fn append_output(&mut self, now: DateTime<Utc>, chunk: &str) {
        self.output.push(now, chunk);
        self.touch(now);
    }

    pub fn status_record(&self, now: DateTime<Utc>) -> SessionStatusRecord {
        SessionStatusRecord {
            session_id: self.session_id.clone(),
            status: self.status,
            host: self.host.clone(),
            username: self.username.clone(),
            start_time: self.start_time,
            last_activity: self.last_activity,
            uptime_secs: seconds_between(self.start_time, now),
            idle_secs: seconds_between(self.last_activity, now),
            os_fingerprint: self.os_fingerprint.clone(),
            commands_count: self.commands_history.len(),
            command_state: self.command_state,
            current_command: self.current_command.clone(),
            last_error: self.last_error.clone(),
            error_kind: self.error_kind,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            host: self.host.clone(),
            username: self.username.clone(),
            status: self.status,
            command_state: self.command_state,
            start_time: self.start_time,
            last_activity: self.last_activity,
        }
    }
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    (later - earlier).num_seconds().max(0) as u64
}
