//! Multi-step task execution on an existing session.
//!
//! [`TaskPlanner::plan`] asks the LLM collaborator to break a task ("install nginx and
//! open port 80") into 3-10 shell commands for the detected OS. The reply is parsed
//! defensively; when nothing usable comes back the task text itself becomes the only
//! step.
//!
//! [`TaskPlanner::execute`] sends the steps one at a time. Each step waits for the
//! decision loop to report the command finished (shell prompt returned) and the run
//! stops at the first step that ends in `error`, times out, or cannot be sent.
//!
//! ## Retry Strategy
//!
//! Planning calls use exponential backoff with jitter via the `backon` crate, capped at
//! [`MAX_RETRY_DELAY`]. Only transient LLM errors (network, 429, 5xx, timeouts) are
//! retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::mcp::config::{DEFAULT_LLM_MAX_RETRIES, MAX_RETRY_DELAY};
use crate::mcp::error::SessionError;
use crate::mcp::llm::{ChatMessage, LlmClient, extract_json_array, extract_json_object};
use crate::mcp::manager::SessionManager;
use crate::mcp::types::{CommandState, SessionStatus, StepOutcome, TaskReport, TaskStatus};

/// Upper bound on planned steps
pub const MAX_PLAN_STEPS: usize = 10;

/// Output tail shown to the planner, in characters
const PLAN_OUTPUT_TAIL: usize = 500;

const PLAN_TEMPERATURE: f32 = 0.3;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Task description is empty")]
    EmptyTask,
}

/// Plans and runs multi-step tasks through a [`SessionManager`].
#[derive(Clone)]
pub struct TaskPlanner {
    manager: SessionManager,
    llm: Arc<dyn LlmClient>,
    step_timeout: Duration,
    max_retries: usize,
    retry_delay: Duration,
}

impl TaskPlanner {
    pub fn new(manager: SessionManager) -> Self {
        let llm = manager.llm();
        let step_timeout = manager.config().step_timeout;
        Self {
            manager,
            llm,
            step_timeout,
            max_retries: DEFAULT_LLM_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry(mut self, max_retries: usize, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Break `task` into shell commands for the session's host.
    pub async fn plan(&self, session_id: &str, task: &str) -> Result<Vec<String>, PlannerError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(PlannerError::EmptyTask);
        }

        let status = self.manager.get_session_status(session_id)?;
        if status.status != SessionStatus::Connected {
            return Err(SessionError::NotConnected {
                id: session_id.to_string(),
                status: status.status,
            }
            .into());
        }
        let recent = self.manager.output_tail(session_id, PLAN_OUTPUT_TAIL)?;

        let os = &status.os_fingerprint;
        let messages = vec![
            ChatMessage::system(format!(
                "You plan shell work on a remote {} {} server. \
                 Break tasks into concrete commands that run non-interactively.",
                os.os_type, os.version
            )),
            ChatMessage::user(format!(
                "Task: {}\n\n\
                 Session:\n- OS: {} {}\n- Recent output:\n{}\n\n\
                 Split the task into 3-10 shell commands, in order. \
                 Reply with a JSON array of strings only, e.g. [\"cmd1\", \"cmd2\"].",
                task, os.os_type, os.version, recent
            )),
        ];

        let attempts = AtomicUsize::new(0);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.max_retries)
            .with_jitter();

        let reply = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            self.llm.chat(&messages, PLAN_TEMPERATURE).await
        })
        .retry(backoff)
        .when(|e| e.is_transient())
        .notify(|err, dur| {
            warn!("Planning call failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let planned = match reply {
            Ok(reply) => parse_plan(&reply).unwrap_or_else(|| {
                warn!("Unusable plan from {}; running the task as one command", self.llm.name());
                vec![task.to_string()]
            }),
            Err(e) => {
                warn!(
                    "Planning failed after {} attempt(s): {}; running the task as one command",
                    attempts.load(Ordering::SeqCst),
                    e
                );
                vec![task.to_string()]
            }
        };

        info!(
            "Session {} planned {} step(s) for: {}",
            session_id,
            planned.len(),
            task
        );
        Ok(planned)
    }

    /// Plan `task` and run it to completion.
    pub async fn execute(&self, session_id: &str, task: &str) -> Result<TaskReport, PlannerError> {
        let planned = self.plan(session_id, task).await?;
        Ok(self
            .run_steps(new_task_id(), session_id, task, planned)
            .await)
    }

    /// Send `planned` one step at a time, waiting for each to finish.
    pub async fn run_steps(
        &self,
        task_id: String,
        session_id: &str,
        task: &str,
        planned: Vec<String>,
    ) -> TaskReport {
        let mut steps = Vec::with_capacity(planned.len());
        let mut status = TaskStatus::Completed;
        let mut message = None;

        for command in &planned {
            let before = match self.manager.command_progress(session_id) {
                Ok(progress) => progress.finished,
                Err(e) => {
                    status = TaskStatus::Failed;
                    message = Some(e.to_string());
                    break;
                }
            };
            let started_at = Utc::now();

            if let Err(e) = self.manager.send_command(session_id, command) {
                status = TaskStatus::Failed;
                message = Some(e.to_string());
                break;
            }
            info!("Task {} step {}: {}", task_id, steps.len() + 1, command);

            let waited = self
                .manager
                .wait_for_completion(session_id, before, self.step_timeout)
                .await;
            let output = self
                .manager
                .get_session_output(session_id, Some(started_at))
                .map(|read| read.output)
                .unwrap_or_default();

            match waited {
                Ok(progress) => {
                    steps.push(StepOutcome {
                        command: command.clone(),
                        state: progress.state,
                        output,
                    });
                    if progress.state == CommandState::Error {
                        status = TaskStatus::Failed;
                        message = self
                            .manager
                            .get_session_status(session_id)
                            .ok()
                            .and_then(|s| s.last_error);
                        break;
                    }
                }
                Err(e) => {
                    steps.push(StepOutcome {
                        command: command.clone(),
                        state: self
                            .manager
                            .command_progress(session_id)
                            .map(|p| p.state)
                            .unwrap_or(CommandState::Error),
                        output,
                    });
                    status = match e {
                        SessionError::Timeout(..) => TaskStatus::TimedOut,
                        _ => TaskStatus::Failed,
                    };
                    message = Some(e.to_string());
                    break;
                }
            }
        }

        info!(
            "Task {} on session {} finished as {:?} after {}/{} step(s)",
            task_id,
            session_id,
            status,
            steps.len(),
            planned.len()
        );
        let _ = self.manager.push_context(
            session_id,
            ChatMessage::assistant(format!(
                "Task `{}` {:?}: {}/{} step(s) run",
                task,
                status,
                steps.len(),
                planned.len()
            )),
        );

        TaskReport {
            task_id,
            session_id: session_id.to_string(),
            task: task.to_string(),
            planned,
            steps,
            status,
            message,
        }
    }
}

pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

/// Commands from an LLM reply: a JSON array of strings, or an object with a
/// `commands` array. Blank entries are dropped and the list is capped at
/// [`MAX_PLAN_STEPS`].
pub fn parse_plan(reply: &str) -> Option<Vec<String>> {
    let items = extract_json_array(reply).or_else(|| {
        extract_json_object(reply).and_then(|map| match map.get("commands") {
            Some(Value::Array(items)) => Some(items.clone()),
            _ => None,
        })
    })?;

    let commands: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .take(MAX_PLAN_STEPS)
        .map(str::to_string)
        .collect();

    if commands.is_empty() {
        None
    } else {
        Some(commands)
    }
}
