//! MCP tool implementations for persistent SSH sessions.
//!
//! - `ssh_create_session`: Open an interactive shell (returns immediately with session_id)
//! - `ssh_send_command`: Queue a command line on a session
//! - `ssh_get_output`: Read session output, optionally only what is new
//! - `ssh_get_status`: Session status, OS fingerprint and command state
//! - `ssh_close_session`: Stop a session and release its connection
//! - `ssh_list_sessions`: List all known sessions
//! - `ssh_session_context`: Messages a session raised for attention
//! - `ssh_execute_task`: Plan and run a multi-step task
//! - `ssh_execute_command`: Run one command on a fresh connection and return its output
//! - `ssh_tool_definitions` / `ssh_invoke_tool`: The same operations as a generic tool registry

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use schemars::JsonSchema;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::manager::SessionManager;
use super::planner::{TaskPlanner, new_task_id};
use super::tools::{ToolDefinition, ToolRegistry};
use super::types::{
    CommandRunResponse, CreateSessionResponse, SessionContextResponse, SessionListResponse, SessionOutputResponse,
    SessionStatusRecord, TaskReport, TaskStatus,
};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ToolDefinitionsResponse {
    pub tools: Vec<ToolDefinition>,
}

/// MCP tools over a shared [`SessionManager`].
#[derive(Clone)]
pub struct McpSessionCommands {
    manager: SessionManager,
    planner: TaskPlanner,
    registry: Arc<ToolRegistry>,
}

impl McpSessionCommands {
    pub fn new(manager: SessionManager) -> Self {
        let planner = TaskPlanner::new(manager.clone());
        let registry = Arc::new(ToolRegistry::with_session_tools(
            manager.clone(),
            planner.clone(),
        ));
        Self {
            manager,
            planner,
            registry,
        }
    }
}

fn parse_since(since: Option<String>) -> Result<Option<DateTime<Utc>>, String> {
    since
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("Invalid `since` timestamp {:?}: {}", s, e))
        })
        .transpose()
}

#[Tools]
impl McpSessionCommands {
    /// Open a persistent interactive SSH shell.
    ///
    /// Returns immediately with a session_id; the connection is made in the background.
    /// Poll `ssh_get_status` until `status` is `connected` (or `error`). Password and
    /// confirmation prompts are answered automatically while commands run.
    async fn ssh_create_session(
        &self,
        /// Host name or address, optionally with ":port" (default port 22)
        host: String,
        /// SSH username
        username: String,
        /// SSH password, also used to answer sudo/su password prompts
        password: String,
        /// Optional command to run once the shell is ready
        initial_command: Option<String>,
    ) -> Result<StructuredContent<CreateSessionResponse>, String> {
        info!("Creating SSH session for {}@{}", username, host);

        let session_id = self
            .manager
            .create_session(
                &host,
                &username,
                SecretString::from(password),
                initial_command.as_deref(),
            )
            .map_err(|e| {
                error!("Failed to create session: {}", e);
                e.to_string()
            })?;

        Ok(StructuredContent(CreateSessionResponse {
            message: format!(
                "Session for {}@{} is connecting. Use session_id '{}' with ssh_send_command and ssh_get_output.",
                username, host, session_id
            ),
            session_id,
        }))
    }

    /// Queue a command line on a connected session.
    ///
    /// Commands run in the order they are sent. Read results with `ssh_get_output`,
    /// passing the previous `read_at` as `since` to receive only new output.
    async fn ssh_send_command(
        &self,
        /// Session ID returned from ssh_create_session
        session_id: String,
        /// Command line to type into the shell
        command: String,
    ) -> Result<Text<String>, String> {
        self.manager
            .send_command(&session_id, &command)
            .map_err(|e| e.to_string())?;
        Ok(Text(format!("Command queued on session {}", session_id)))
    }

    /// Read session output.
    ///
    /// Without `since` the full retained history is returned. Reads never consume
    /// output, so repeated calls with the same `since` return the same text.
    async fn ssh_get_output(
        &self,
        /// Session ID returned from ssh_create_session
        session_id: String,
        /// Only return output received after this RFC 3339 timestamp (use a previous read_at)
        since: Option<String>,
    ) -> Result<StructuredContent<SessionOutputResponse>, String> {
        let since = parse_since(since)?;
        let read = self
            .manager
            .get_session_output(&session_id, since)
            .map_err(|e| e.to_string())?;
        let status = self
            .manager
            .get_session_status(&session_id)
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(SessionOutputResponse {
            session_id,
            status: status.status,
            command_state: status.command_state,
            output: read.output,
            read_at: read.read_at,
        }))
    }

    /// Session status, OS fingerprint, command state and last error.
    async fn ssh_get_status(
        &self,
        /// Session ID returned from ssh_create_session
        session_id: String,
    ) -> Result<StructuredContent<SessionStatusRecord>, String> {
        self.manager
            .get_session_status(&session_id)
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Close a session and stop its background tasks.
    ///
    /// The session stays listed with status `closed` so its output can still be read.
    async fn ssh_close_session(
        &self,
        /// Session ID to close
        session_id: String,
    ) -> Result<Text<String>, String> {
        info!("Closing SSH session: {}", session_id);
        self.manager
            .close_session(&session_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Text(format!("Session {} closed", session_id)))
    }

    /// List all known sessions, oldest first.
    async fn ssh_list_sessions(&self) -> StructuredContent<SessionListResponse> {
        let sessions = self.manager.list_sessions();
        StructuredContent(SessionListResponse {
            count: sessions.len(),
            sessions,
        })
    }

    /// Messages a session raised for attention.
    ///
    /// Includes failed commands, prompts that could not be answered automatically,
    /// repeated password prompts and finished tasks.
    async fn ssh_session_context(
        &self,
        /// Session ID returned from ssh_create_session
        session_id: String,
    ) -> Result<StructuredContent<SessionContextResponse>, String> {
        let messages = self
            .manager
            .message_context(&session_id)
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(SessionContextResponse {
            session_id,
            messages,
        }))
    }

    /// Plan a task as shell commands and run them one by one.
    ///
    /// **Background mode** (`wait=false`, default): returns the plan with status
    /// `started`; follow progress with `ssh_get_output` and `ssh_session_context`.
    ///
    /// **Blocking mode** (`wait=true`): returns the full report once every step has
    /// finished, a step failed, or a step timed out.
    async fn ssh_execute_task(
        &self,
        /// Session ID returned from ssh_create_session
        session_id: String,
        /// What to accomplish, in plain language (e.g., "install nginx and start it")
        task: String,
        /// Block until the task finishes (default: false)
        wait: Option<bool>,
    ) -> Result<StructuredContent<TaskReport>, String> {
        let planned = self
            .planner
            .plan(&session_id, &task)
            .await
            .map_err(|e| e.to_string())?;
        let task_id = new_task_id();

        if wait.unwrap_or(false) {
            let report = self
                .planner
                .run_steps(task_id, &session_id, &task, planned)
                .await;
            return Ok(StructuredContent(report));
        }

        let planner = self.planner.clone();
        let (bg_task_id, bg_session, bg_task, bg_planned) = (
            task_id.clone(),
            session_id.clone(),
            task.clone(),
            planned.clone(),
        );
        tokio::spawn(async move {
            planner
                .run_steps(bg_task_id, &bg_session, &bg_task, bg_planned)
                .await;
        });

        Ok(StructuredContent(TaskReport {
            message: Some(format!(
                "Running {} step(s) in the background; check ssh_session_context for the result",
                planned.len()
            )),
            task_id,
            session_id,
            task,
            planned,
            steps: Vec::new(),
            status: TaskStatus::Started,
        }))
    }

    /// Run a single command and return its output.
    ///
    /// Opens a session, runs the command, and closes the session again. Password and
    /// confirmation prompts are answered as in persistent sessions. The detected OS
    /// is remembered for later sessions to the same host.
    async fn ssh_execute_command(
        &self,
        /// Host name or address, optionally with ":port" (default port 22)
        host: String,
        /// SSH username
        username: String,
        /// SSH password, also used to answer sudo/su password prompts
        password: String,
        /// Command line to run
        command: String,
        /// Seconds to wait for the command to finish, including the connection
        timeout_secs: Option<u64>,
    ) -> Result<StructuredContent<CommandRunResponse>, String> {
        info!("Running one-shot command for {}@{}", username, host);
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.manager.one_shot_timeout());

        self.manager
            .execute_command(
                &host,
                &username,
                SecretString::from(password),
                &command,
                timeout,
            )
            .await
            .map(StructuredContent)
            .map_err(|e| {
                error!("One-shot command on {}@{} failed: {}", username, host, e);
                e.to_string()
            })
    }

    /// Session operations as OpenAI-style tool definitions for a tool-calling loop.
    async fn ssh_tool_definitions(&self) -> StructuredContent<ToolDefinitionsResponse> {
        StructuredContent(ToolDefinitionsResponse {
            tools: self.registry.definitions(),
        })
    }

    /// Invoke a registry tool by name with a JSON arguments object.
    async fn ssh_invoke_tool(
        &self,
        /// Tool name from ssh_tool_definitions (e.g., "get_status")
        name: String,
        /// Arguments object matching the tool's parameter schema
        arguments: serde_json::Value,
    ) -> Result<Text<String>, String> {
        let result = self
            .registry
            .invoke(&name, arguments)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&result)
            .map(Text)
            .map_err(|e| e.to_string())
    }
}
