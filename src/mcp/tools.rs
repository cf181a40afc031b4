//! Tool registry - name to handler lookup for LLM tool-calling loops.
//!
//! Every session operation is also available as a [`Tool`] with a JSON Schema for its
//! arguments, so an orchestrating model can discover them through
//! [`ToolRegistry::definitions`] (or [`ToolRegistry::openai_functions`]) and call them
//! by name through [`ToolRegistry::invoke`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::{JsonSchema, schema_for};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::mcp::error::SessionError;
use crate::mcp::manager::SessionManager;
use crate::mcp::planner::{PlannerError, TaskPlanner};
use crate::mcp::types::{
    CreateSessionResponse, SessionContextResponse, SessionListResponse, SessionOutputResponse,
};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Planner(#[from] PlannerError),
}

/// Tool metadata and argument schema
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Use the JSON Schema of `T` as the argument schema.
    #[must_use]
    pub fn with_args<T: JsonSchema>(self) -> Self {
        let schema =
            serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}));
        self.with_parameters(schema)
    }

    /// OpenAI-style function entry: `{"type": "function", "function": {...}}`
    pub fn to_openai_function(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    /// Run the tool with a JSON arguments object.
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

/// Registry of tools keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every session tool.
    pub fn with_session_tools(manager: SessionManager, planner: TaskPlanner) -> Self {
        let mut registry = Self::new();
        for kind in SessionToolKind::ALL {
            registry.register(Arc::new(SessionTool::new(
                kind,
                manager.clone(),
                planner.clone(),
            )));
        }
        registry
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition().clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn openai_functions(&self) -> Vec<Value> {
        self.definitions()
            .iter()
            .map(ToolDefinition::to_openai_function)
            .collect()
    }

    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        debug!(tool = %name, "Invoking tool");
        tool.invoke(args).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct CreateSessionArgs {
    /// Host name or address, optionally with `:port`
    pub host: String,
    pub username: String,
    pub password: String,
    /// Command to run once the shell is ready
    #[serde(default)]
    pub initial_command: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
pub struct ExecuteCommandArgs {
    /// Host name or address, optionally with `:port`
    pub host: String,
    pub username: String,
    pub password: String,
    pub command: String,
    /// Seconds to wait for the command to finish, including the connection
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SendCommandArgs {
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetOutputArgs {
    pub session_id: String,
    /// Only return output received after this instant (RFC 3339)
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionIdArgs {
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteTaskArgs {
    pub session_id: String,
    /// What to accomplish, in plain language
    pub task: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoArgs {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionToolKind {
    CreateSession,
    SendCommand,
    GetOutput,
    GetStatus,
    CloseSession,
    ListSessions,
    SessionContext,
    ExecuteTask,
    ExecuteCommand,
}

impl SessionToolKind {
    const ALL: [SessionToolKind; 9] = [
        SessionToolKind::CreateSession,
        SessionToolKind::SendCommand,
        SessionToolKind::GetOutput,
        SessionToolKind::GetStatus,
        SessionToolKind::CloseSession,
        SessionToolKind::ListSessions,
        SessionToolKind::SessionContext,
        SessionToolKind::ExecuteTask,
        SessionToolKind::ExecuteCommand,
    ];

    fn definition(self) -> ToolDefinition {
        match self {
            SessionToolKind::CreateSession => ToolDefinition::new(
                "create_session",
                "Open a persistent interactive SSH shell and return its session_id",
            )
            .with_args::<CreateSessionArgs>(),
            SessionToolKind::SendCommand => ToolDefinition::new(
                "send_command",
                "Queue a command line on a connected session; read results with get_output",
            )
            .with_args::<SendCommandArgs>(),
            SessionToolKind::GetOutput => ToolDefinition::new(
                "get_output",
                "Read session output, optionally only what arrived after `since`",
            )
            .with_args::<GetOutputArgs>(),
            SessionToolKind::GetStatus => {
                ToolDefinition::new("get_status", "Status, OS and command state of a session")
                    .with_args::<SessionIdArgs>()
            }
            SessionToolKind::CloseSession => {
                ToolDefinition::new("close_session", "Close a session and stop its tasks")
                    .with_args::<SessionIdArgs>()
            }
            SessionToolKind::ListSessions => {
                ToolDefinition::new("list_sessions", "List all known sessions")
                    .with_args::<NoArgs>()
            }
            SessionToolKind::SessionContext => ToolDefinition::new(
                "session_context",
                "Messages the session raised for attention (failures, unanswered prompts)",
            )
            .with_args::<SessionIdArgs>(),
            SessionToolKind::ExecuteTask => ToolDefinition::new(
                "execute_task",
                "Plan a task as shell commands and run them step by step",
            )
            .with_args::<ExecuteTaskArgs>(),
            SessionToolKind::ExecuteCommand => ToolDefinition::new(
                "execute_command",
                "Run one command on a fresh connection and return its output",
            )
            .with_args::<ExecuteCommandArgs>(),
        }
    }
}

struct SessionTool {
    kind: SessionToolKind,
    definition: ToolDefinition,
    manager: SessionManager,
    planner: TaskPlanner,
}

impl SessionTool {
    fn new(kind: SessionToolKind, manager: SessionManager, planner: TaskPlanner) -> Self {
        Self {
            kind,
            definition: kind.definition(),
            manager,
            planner,
        }
    }

    fn parse<T: DeserializeOwned>(&self, args: Value) -> Result<T, ToolError> {
        // Tools without arguments also accept `null`
        let args = if args.is_null() { json!({}) } else { args };
        serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
            tool: self.definition.name.clone(),
            reason: e.to_string(),
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[async_trait]
impl Tool for SessionTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        match self.kind {
            SessionToolKind::CreateSession => {
                let args: CreateSessionArgs = self.parse(args)?;
                let session_id = self.manager.create_session(
                    &args.host,
                    &args.username,
                    SecretString::from(args.password),
                    args.initial_command.as_deref(),
                )?;
                Ok(to_json(&CreateSessionResponse {
                    message: format!(
                        "Session {} created for {}@{}",
                        session_id, args.username, args.host
                    ),
                    session_id,
                }))
            }
            SessionToolKind::SendCommand => {
                let args: SendCommandArgs = self.parse(args)?;
                self.manager.send_command(&args.session_id, &args.command)?;
                Ok(json!({ "session_id": args.session_id, "queued": args.command }))
            }
            SessionToolKind::GetOutput => {
                let args: GetOutputArgs = self.parse(args)?;
                let read = self.manager.get_session_output(&args.session_id, args.since)?;
                let status = self.manager.get_session_status(&args.session_id)?;
                Ok(to_json(&SessionOutputResponse {
                    session_id: args.session_id,
                    status: status.status,
                    command_state: status.command_state,
                    output: read.output,
                    read_at: read.read_at,
                }))
            }
            SessionToolKind::GetStatus => {
                let args: SessionIdArgs = self.parse(args)?;
                Ok(to_json(&self.manager.get_session_status(&args.session_id)?))
            }
            SessionToolKind::CloseSession => {
                let args: SessionIdArgs = self.parse(args)?;
                self.manager.close_session(&args.session_id).await?;
                Ok(json!({ "session_id": args.session_id, "closed": true }))
            }
            SessionToolKind::ListSessions => {
                let _: NoArgs = self.parse(args)?;
                let sessions = self.manager.list_sessions();
                Ok(to_json(&SessionListResponse {
                    count: sessions.len(),
                    sessions,
                }))
            }
            SessionToolKind::SessionContext => {
                let args: SessionIdArgs = self.parse(args)?;
                let messages = self.manager.message_context(&args.session_id)?;
                Ok(to_json(&SessionContextResponse {
                    session_id: args.session_id,
                    messages,
                }))
            }
            SessionToolKind::ExecuteTask => {
                let args: ExecuteTaskArgs = self.parse(args)?;
                let report = self.planner.execute(&args.session_id, &args.task).await?;
                Ok(to_json(&report))
            }
            SessionToolKind::ExecuteCommand => {
                let args: ExecuteCommandArgs = self.parse(args)?;
                let timeout = args
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.manager.one_shot_timeout());
                let run = self
                    .manager
                    .execute_command(
                        &args.host,
                        &args.username,
                        SecretString::from(args.password),
                        &args.command,
                        timeout,
                    )
                    .await?;
                Ok(to_json(&run))
            }
        }
    }
}
