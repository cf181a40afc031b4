//! Persistent SSH sessions with autonomous prompt handling, exposed as MCP tools.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Serializable status and response types
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Session and transport errors, connect-failure classification
//! - `client` / `auth`: russh connection, PTY shell and password authentication
//! - `transport`: Per-session task owning the remote shell
//! - `channel`: Input/output queues between the transport and decision tasks
//! - `decode`: Byte-to-text decoding for terminal output
//! - `patterns`: Terminal output classification and OS detection
//! - `decision`: Per-session task reacting to prompts and tracking command state
//! - `suggest`: LLM-backed answers for confirmation prompts
//! - `llm`: Chat-completion collaborator
//! - `session` / `storage`: Session records and the shared registry
//! - `manager`: Session lifecycle API and idle reaper
//! - `planner`: Multi-step task planning and execution
//! - `tools`: Name-to-handler tool registry
//! - `commands`: MCP tool implementations

pub mod auth;
pub mod channel;
pub mod client;
pub mod commands;
pub mod config;
pub mod decision;
pub mod decode;
pub mod error;
pub mod llm;
pub mod manager;
pub mod patterns;
pub mod planner;
pub(crate) mod schema;
pub mod session;
pub mod storage;
pub mod suggest;
#[cfg(test)]
pub(crate) mod testing;
pub mod tools;
pub mod transport;
pub mod types;

pub use commands::McpSessionCommands;
pub use manager::SessionManager;
