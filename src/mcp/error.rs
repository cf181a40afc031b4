//! Error types and connection failure classification.
//!
//! Each layer has its own `thiserror` enum:
//!
//! - [`SessionError`]: misuse of the manager API (unknown session, not connected, ...)
//! - [`TransportError`]: connection and shell I/O failures, terminal for a session
//!
//! LLM and planner errors live next to their modules.
//!
//! # Classification Strategy
//!
//! Fatal connection failures are labelled with an [`ErrorKind`] so callers can tell a
//! wrong password from an unreachable host without parsing messages:
//!
//! 1. **Authentication**: checked first; credentials will not fix themselves
//! 2. **Timeout**: the host did not answer within the connect bound
//! 3. **Network**: refused, reset, unreachable, DNS failures
//! 4. **Protocol**: anything else (handshake, channel, key exchange)

use std::time::Duration;

use thiserror::Error;

use crate::mcp::types::{ErrorKind, SessionStatus};

/// Errors returned by the session manager API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Session {id} is not connected (status: {status})")]
    NotConnected { id: String, status: SessionStatus },

    #[error("Session {0} has no running decision loop")]
    Ended(String),

    #[error("Failed to spawn session tasks: {0}")]
    Spawn(String),

    #[error("Timed out after {0:?} waiting for session {1}")]
    Timeout(Duration, String),

    #[error("Session {id} could not run its command: {reason}")]
    ConnectFailed { id: String, reason: String },

    #[error("Command must not be empty")]
    EmptyCommand,
}

/// Connection and shell I/O failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Shell I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::ConnectTimeout(_) => ErrorKind::Timeout,
            TransportError::Auth(_) => ErrorKind::Authentication,
            TransportError::Connect(msg) | TransportError::Channel(msg) | TransportError::Io(msg) => {
                classify_connect_error(msg)
            }
        }
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "keyboard-interactive authentication failed",
    "permission denied",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

const TIMEOUT_ERRORS: &[&str] = &["timed out", "timeout"];

/// Network error patterns: refused, reset, unreachable, name resolution.
const NETWORK_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "failed to lookup",
    "name or service not known",
    "failed to connect",
    "broken pipe",
];

/// Classify a connection failure message.
///
/// Authentication patterns take precedence, so "timeout during authentication failed"
/// is reported as [`ErrorKind::Authentication`].
pub fn classify_connect_error(error: &str) -> ErrorKind {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return ErrorKind::Authentication;
    }
    if TIMEOUT_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return ErrorKind::Timeout;
    }
    if NETWORK_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return ErrorKind::Network;
    }
    ErrorKind::Protocol
}
