//! Session manager: the registry of live sessions and their tasks.
//!
//! # Architecture
//!
//! [`SessionManager`] is a cheap-to-clone handle over shared state:
//!
//! - a [`SessionStore`] with one [`SessionRecord`] per session (kept after close for
//!   post-mortem reads)
//! - a runtime map with the control end, progress receiver and join handles of each
//!   session's transport and decision tasks
//! - the shell connector and LLM collaborator shared by every session
//!
//! Per session two tasks run on the Tokio runtime, bound by one interaction channel:
//!
//! ```text
//! send_command ──> input queue ──> TransportTask ──> remote shell
//!                      ^                │
//!                      │ replies        │ output queue
//!                      └─── DecisionLoop <┘
//! ```
//!
//! # Reaper
//!
//! [`SessionManager::start_reaper`] runs [`SessionManager::reap_at`] every
//! `reaper_interval`: connected sessions idle longer than `idle_timeout` are closed,
//! and `error` / `disconnected` sessions inactive for `zombie_timeout` are purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use secrecy::SecretString;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mcp::channel::{ControlEnd, interaction_channel};
use crate::mcp::client::RusshConnector;
use crate::mcp::config::{LlmSettings, ManagerConfig};
use crate::mcp::decision::DecisionLoop;
use crate::mcp::error::SessionError;
use crate::mcp::llm::{ChatMessage, LlmClient, client_from_settings};
use crate::mcp::session::{SessionRecord, generate_session_id};
use crate::mcp::storage::SessionStore;
use crate::mcp::transport::{ConnectTarget, ShellConnector, TransportSettings, TransportTask};
use crate::mcp::types::{
    CommandProgress, CommandRunResponse, CommandState, OsFingerprint, ReapReport, SessionStatus,
    SessionStatusRecord, SessionSummary,
};

/// Output read through [`SessionManager::get_session_output`].
#[derive(Debug, Clone)]
pub struct OutputRead {
    pub output: String,
    /// Newest chunk timestamp; pass it back as `since` to read only newer output
    pub read_at: DateTime<Utc>,
}

/// Handles for the tasks of one session.
struct SessionRuntime {
    control: ControlEnd,
    progress: watch::Receiver<CommandProgress>,
    transport: JoinHandle<()>,
    decision: JoinHandle<()>,
}

struct ManagerInner {
    config: ManagerConfig,
    store: Arc<SessionStore>,
    runtimes: DashMap<String, SessionRuntime>,
    connector: Arc<dyn ShellConnector>,
    llm: Arc<dyn LlmClient>,
    shutdown: CancellationToken,
}

/// Creates, drives and tears down SSH sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn ShellConnector>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store: Arc::new(SessionStore::new()),
                runtimes: DashMap::new(),
                connector,
                llm,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Manager with the russh connector and the LLM configured from the environment.
    pub fn from_env() -> Self {
        Self::new(
            ManagerConfig::from_env(),
            Arc::new(RusshConnector::from_env()),
            client_from_settings(LlmSettings::from_env()),
        )
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn llm(&self) -> Arc<dyn LlmClient> {
        self.inner.llm.clone()
    }

    /// Default bound for [`Self::execute_command`]: connect, banner and one step.
    pub fn one_shot_timeout(&self) -> Duration {
        let config = &self.inner.config;
        config.connect_timeout + config.banner_wait + config.step_timeout
    }

    /// Register a session and start its tasks. Returns before the connection is made;
    /// connection failures show up as `status = error`.
    ///
    /// # Errors
    ///
    /// [`SessionError::Spawn`] when called outside a Tokio runtime.
    pub fn create_session(
        &self,
        host: &str,
        username: &str,
        password: SecretString,
        initial_command: Option<&str>,
    ) -> Result<String, SessionError> {
        let runtime = Handle::try_current().map_err(|e| SessionError::Spawn(e.to_string()))?;
        let config = &self.inner.config;
        let password = Arc::new(password);

        let mut record = SessionRecord::new(
            generate_session_id(username, host, Utc::now()),
            host.to_string(),
            username.to_string(),
            password.clone(),
            config.history_max_entries,
            Utc::now(),
        );
        if let Some(os) = self.inner.store.cached_os(username, host) {
            record.record_os(&os);
        }
        if let Some(command) = initial_command.filter(|c| !c.trim().is_empty()) {
            record.commands_history.push(command.to_string());
        }
        let session_id = loop {
            let candidate = record.session_id.clone();
            match self.inner.store.try_insert(record) {
                Ok(()) => break candidate,
                Err(taken) => {
                    record = taken;
                    record.session_id = generate_session_id(username, host, record.start_time);
                }
            }
        };

        let (transport_end, decision_end, control) = interaction_channel();

        let transport = TransportTask {
            session_id: session_id.clone(),
            store: self.inner.store.clone(),
            connector: self.inner.connector.clone(),
            target: ConnectTarget {
                host: host.to_string(),
                username: username.to_string(),
                password: password.clone(),
            },
            initial_command: initial_command.map(str::to_string),
            settings: TransportSettings {
                connect_timeout: config.connect_timeout,
                poll_interval: config.poll_interval,
                banner_wait: config.banner_wait,
            },
            end: transport_end,
        };

        let (decision, progress) = DecisionLoop::new(
            session_id.clone(),
            self.inner.store.clone(),
            self.inner.llm.clone(),
            password,
            config.llm_timeout,
            decision_end,
        );

        let transport = runtime.spawn(transport.run());
        let decision = runtime.spawn(decision.run());

        self.inner.runtimes.insert(
            session_id.clone(),
            SessionRuntime {
                control,
                progress,
                transport,
                decision,
            },
        );

        info!("Created session {} for {}@{}", session_id, username, host);
        Ok(session_id)
    }

    /// Queue a command for the remote shell. Non-blocking.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] for unknown ids
    /// - [`SessionError::NotConnected`] unless the session is `connected`
    /// - [`SessionError::Ended`] when the transport is gone
    pub fn send_command(&self, session_id: &str, command: &str) -> Result<(), SessionError> {
        let status = self
            .inner
            .store
            .read(session_id, |r| r.status())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if status != SessionStatus::Connected {
            warn!(
                "Refusing command for session {} in status {}",
                session_id, status
            );
            return Err(SessionError::NotConnected {
                id: session_id.to_string(),
                status,
            });
        }

        let control = self
            .inner
            .runtimes
            .get(session_id)
            .map(|rt| rt.control.clone())
            .ok_or_else(|| SessionError::Ended(session_id.to_string()))?;

        if !control.send_command(command) {
            return Err(SessionError::Ended(session_id.to_string()));
        }
        self.inner.store.update(session_id, |r| {
            r.commands_history.push(command.to_string());
            r.touch(Utc::now());
        });
        debug!("Queued command for session {}: {}", session_id, command);
        Ok(())
    }

    /// Output newer than `since` (all retained output when `None`). Idempotent.
    pub fn get_session_output(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<OutputRead, SessionError> {
        self.inner
            .store
            .read(session_id, |r| OutputRead {
                output: r.output.since(since),
                read_at: r
                    .output
                    .latest()
                    .into_iter()
                    .chain(since)
                    .max()
                    .unwrap_or(r.start_time),
            })
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn get_session_status(&self, session_id: &str) -> Result<SessionStatusRecord, SessionError> {
        self.inner
            .store
            .read(session_id, |r| r.status_record(Utc::now()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Messages the decision loop escalated for the orchestrating model.
    pub fn message_context(&self, session_id: &str) -> Result<Vec<ChatMessage>, SessionError> {
        self.inner
            .store
            .read(session_id, |r| r.context.to_vec())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Append a note to the session's message context.
    pub fn push_context(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError> {
        self.inner
            .store
            .update(session_id, |r| r.context.push(message))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Recent output, at most `max_chars` characters.
    pub fn output_tail(&self, session_id: &str, max_chars: usize) -> Result<String, SessionError> {
        self.inner
            .store
            .read(session_id, |r| r.output.tail(max_chars))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn command_progress(&self, session_id: &str) -> Result<CommandProgress, SessionError> {
        if let Some(rt) = self.inner.runtimes.get(session_id) {
            return Ok(rt.progress.borrow().clone());
        }
        self.inner
            .store
            .read(session_id, |r| CommandProgress {
                state: r.command_state,
                finished: r.commands_finished,
            })
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Wait until more than `after` commands have finished.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Ended`] if the decision loop stops first
    /// - [`SessionError::Timeout`] after `timeout`
    pub async fn wait_for_completion(
        &self,
        session_id: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<CommandProgress, SessionError> {
        let mut progress = match self.inner.runtimes.get(session_id) {
            Some(rt) => rt.progress.clone(),
            None if self.inner.store.contains(session_id) => {
                return Err(SessionError::Ended(session_id.to_string()));
            }
            None => return Err(SessionError::NotFound(session_id.to_string())),
        };

        let waited = tokio::time::timeout(
            timeout,
            progress.wait_for(|p| p.finished > after),
        )
        .await
        .map(|result| result.map(|p| p.clone()));

        match waited {
            Ok(Ok(progress)) => Ok(progress),
            Ok(Err(_)) => Err(SessionError::Ended(session_id.to_string())),
            Err(_) => Err(SessionError::Timeout(timeout, session_id.to_string())),
        }
    }

    /// Run one command on a throwaway session and return its output.
    ///
    /// The session is created with `command` as its initial command, given `timeout`
    /// to connect and return to the prompt, then stopped and dropped from the registry.
    /// The detected OS stays cached for the host.
    ///
    /// # Errors
    ///
    /// - [`SessionError::EmptyCommand`] for a blank command
    /// - [`SessionError::ConnectFailed`] when the connection or shell ends first
    /// - [`SessionError::Timeout`] after `timeout`
    pub async fn execute_command(
        &self,
        host: &str,
        username: &str,
        password: SecretString,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandRunResponse, SessionError> {
        if command.trim().is_empty() {
            return Err(SessionError::EmptyCommand);
        }
        let session_id = self.create_session(host, username, password, Some(command))?;
        info!("Running one-shot command on {}: {}", session_id, command);

        let result = self.collect_command(&session_id, timeout).await;

        self.stop_tasks(&session_id).await;
        self.inner.store.remove(&session_id);
        result.map(|(state, output, os_fingerprint)| CommandRunResponse {
            host: host.to_string(),
            username: username.to_string(),
            command: command.to_string(),
            state,
            output,
            os_fingerprint,
        })
    }

    async fn collect_command(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<(CommandState, String, OsFingerprint), SessionError> {
        let waited = self.wait_for_completion(session_id, 0, timeout).await;
        let (output, os, status, last_error) = self
            .inner
            .store
            .read(session_id, |r| {
                (
                    r.last_command_output.clone().unwrap_or_default(),
                    r.os_fingerprint().clone(),
                    r.status(),
                    r.last_error.clone(),
                )
            })
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        match waited {
            Ok(progress) => Ok((progress.state, output, os)),
            Err(SessionError::Ended(_)) => Err(SessionError::ConnectFailed {
                id: session_id.to_string(),
                reason: last_error.unwrap_or_else(|| format!("session ended as {}", status)),
            }),
            Err(e) => Err(e),
        }
    }

    /// Stop the session's tasks and mark it `closed`. The record stays readable.
    ///
    /// Each task gets `join_timeout` to exit; late tasks are aborted.
    pub async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        if !self.inner.store.contains(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        self.stop_tasks(session_id).await;

        self.inner.store.update(session_id, |r| {
            r.set_status(SessionStatus::Closed);
        });
        info!("Closed session {}", session_id);
        Ok(())
    }

    /// Signal stop and join both tasks. `None` if the session had no running tasks.
    async fn stop_tasks(&self, session_id: &str) -> Option<(TaskExit, TaskExit)> {
        let (_, runtime) = self.inner.runtimes.remove(session_id)?;
        runtime.control.stop();
        let join_timeout = self.inner.config.join_timeout;
        let transport = join_task(session_id, "transport", runtime.transport, join_timeout).await;
        let decision = join_task(session_id, "decision", runtime.decision, join_timeout).await;
        Some((transport, decision))
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions = self.inner.store.list();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    /// One reaper pass as of `now`.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> ReapReport {
        let config = &self.inner.config;
        let idle_limit = chrono::Duration::from_std(config.idle_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let zombie_limit = chrono::Duration::from_std(config.zombie_timeout)
            .unwrap_or(chrono::Duration::MAX);

        let mut report = ReapReport::default();
        for (session_id, status, last_activity) in self.inner.store.activity_snapshot() {
            let inactive = now - last_activity;

            if status == SessionStatus::Connected && inactive > idle_limit {
                info!(
                    "Closing session {} after {}s idle",
                    session_id,
                    inactive.num_seconds()
                );
                if self.close_session(&session_id).await.is_ok() {
                    report.closed.push(session_id);
                }
            } else if status.is_dead() && inactive > zombie_limit {
                info!("Purging dead session {} ({})", session_id, status);
                if let Some((_, runtime)) = self.inner.runtimes.remove(&session_id) {
                    runtime.control.stop();
                    runtime.transport.abort();
                    runtime.decision.abort();
                }
                self.inner.store.remove(&session_id);
                report.purged.push(session_id);
            }
        }
        report
    }

    /// Run [`Self::reap_at`] every `reaper_interval` until [`Self::shutdown`].
    pub fn start_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.reap_at(Utc::now()).await;
                        if !report.is_empty() {
                            info!(
                                "Reaper closed {} and purged {} session(s)",
                                report.closed.len(),
                                report.purged.len()
                            );
                        }
                    }
                }
            }
            debug!("Reaper stopped");
        })
    }

    /// Stop the reaper and close every session concurrently.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let ids: Vec<String> = self
            .inner
            .runtimes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!("Shutting down {} session(s)", ids.len());
        join_all(ids.iter().map(|id| self.close_session(id))).await;
    }
}

/// How a session task ended when it was joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskExit {
    /// Returned on its own after the stop signal
    Stopped,
    /// Panicked or was cancelled elsewhere
    Failed,
    /// Still running after the join timeout
    Aborted,
}

async fn join_task(
    session_id: &str,
    name: &str,
    mut handle: JoinHandle<()>,
    limit: Duration,
) -> TaskExit {
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(())) => TaskExit::Stopped,
        Ok(Err(e)) => {
            warn!("Session {} {} task failed: {}", session_id, name, e);
            TaskExit::Failed
        }
        Err(_) => {
            warn!(
                "Session {} {} task did not stop within {:?}; aborting",
                session_id, name, limit
            );
            handle.abort();
            TaskExit::Aborted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::SessionError;
    use crate::mcp::llm::DisabledLlm;
    use crate::mcp::testing::{MockConnector, MockShellScript, eventually, fast_config};
    use crate::mcp::types::CommandState;

    const PROMPT: &str = "bob@web01:~$ ";

    fn manager_with(connector: Arc<MockConnector>) -> SessionManager {
        let config = ManagerConfig {
            idle_timeout: Duration::from_secs(60),
            zombie_timeout: Duration::from_secs(120),
            ..fast_config()
        };
        SessionManager::new(config, connector, Arc::new(DisabledLlm))
    }

    fn ubuntu_shell() -> MockShellScript {
        MockShellScript::new()
            .banner("Welcome to Ubuntu 22.04.3 LTS (GNU/Linux 5.15.0-86-generic x86_64)\r\n")
            .banner(PROMPT)
    }

    fn password() -> SecretString {
        SecretString::from("secret".to_string())
    }

    async fn connected(manager: &SessionManager) -> String {
        let id = manager
            .create_session("web01", "bob", password(), None)
            .unwrap();
        assert!(
            eventually(|| manager.get_session_status(&id).unwrap().status
                == SessionStatus::Connected)
            .await
        );
        assert!(
            eventually(|| manager
                .get_session_output(&id, None)
                .unwrap()
                .output
                .contains(PROMPT))
            .await
        );
        id
    }

    mod scenarios {
        use super::*;

        #[tokio::test]
        async fn test_sudo_password_is_typed_automatically() {
            let script = ubuntu_shell()
                .on("sudo apt update", "sudo apt update\r\n[sudo] password for bob: ")
                .on(
                    "secret",
                    "\r\nHit:1 http://archive.ubuntu.com/ubuntu jammy InRelease\r\n\
                     Reading package lists... Done\r\nbob@web01:~$ ",
                );
            let connector = Arc::new(MockConnector::shell(script));
            let written = connector.written();
            let manager = manager_with(connector);
            let id = connected(&manager).await;

            manager.send_command(&id, "sudo apt update").unwrap();
            let progress = manager
                .wait_for_completion(&id, 0, Duration::from_secs(2))
                .await
                .unwrap();

            assert_eq!(progress.finished, 1);
            assert_eq!(written.lines(), vec!["sudo apt update", "secret"]);
            let status = manager.get_session_status(&id).unwrap();
            assert_eq!(status.status, SessionStatus::Connected);
            assert_eq!(status.command_state, CommandState::Idle);
            assert_eq!(status.os_fingerprint.os_type, "Ubuntu");
            assert!(
                manager
                    .get_session_output(&id, None)
                    .unwrap()
                    .output
                    .contains("Reading package lists")
            );
        }

        #[tokio::test]
        async fn test_simple_command_returns_to_idle() {
            let script = ubuntu_shell().on("ls", "ls\r\nfile1  file2\r\nbob@web01:~$ ");
            let manager = manager_with(Arc::new(MockConnector::shell(script)));
            let id = connected(&manager).await;

            manager.send_command(&id, "ls").unwrap();
            manager
                .wait_for_completion(&id, 0, Duration::from_secs(2))
                .await
                .unwrap();

            let output = manager.get_session_output(&id, None).unwrap().output;
            assert!(output.contains("file1  file2"));
            let status = manager.get_session_status(&id).unwrap();
            assert_eq!(status.command_state, CommandState::Idle);
            assert_eq!(status.commands_count, 1);
        }

        #[tokio::test]
        async fn test_unreachable_host_ends_in_error() {
            let manager = manager_with(Arc::new(MockConnector::hanging()));
            let id = manager
                .create_session("10.255.255.1", "bob", password(), Some("uptime"))
                .unwrap();

            assert!(
                eventually(|| manager.get_session_status(&id).unwrap().status
                    == SessionStatus::Error)
                .await
            );
            let output = manager.get_session_output(&id, None).unwrap().output;
            assert!(output.contains("[fatal]"));
            assert!(matches!(
                manager.send_command(&id, "ls"),
                Err(SessionError::NotConnected { .. })
            ));
        }
    }

    mod commands {
        use super::*;

        #[tokio::test]
        async fn test_commands_reach_the_shell_in_order() {
            let connector = Arc::new(MockConnector::shell(ubuntu_shell()));
            let written = connector.written();
            let manager = manager_with(connector);
            let id = connected(&manager).await;

            for i in 0..5 {
                manager.send_command(&id, &format!("echo {}", i)).unwrap();
            }

            assert!(eventually(|| written.lines().len() == 5).await);
            let expected: Vec<String> = (0..5).map(|i| format!("echo {}", i)).collect();
            assert_eq!(written.lines(), expected);
        }

        #[tokio::test]
        async fn test_unknown_session() {
            let manager = manager_with(Arc::new(MockConnector::hanging()));
            assert!(matches!(
                manager.send_command("nope", "ls"),
                Err(SessionError::NotFound(_))
            ));
            assert!(manager.get_session_output("nope", None).is_err());
            assert!(manager.get_session_status("nope").is_err());
            assert!(matches!(
                manager.close_session("nope").await,
                Err(SessionError::NotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_wait_for_completion_times_out() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let id = connected(&manager).await;
            manager.send_command(&id, "sleep 100").unwrap();

            let result = manager
                .wait_for_completion(&id, 0, Duration::from_millis(100))
                .await;
            assert!(matches!(result, Err(SessionError::Timeout(_, _))));
        }

        #[tokio::test]
        async fn test_initial_command_is_counted() {
            let script =
                ubuntu_shell().on("uptime", "uptime\r\n 10:02:11 up 3 days\r\nbob@web01:~$ ");
            let connector = Arc::new(MockConnector::shell(script));
            let written = connector.written();
            let manager = manager_with(connector);
            let id = manager
                .create_session("web01", "bob", password(), Some("uptime"))
                .unwrap();

            assert_eq!(manager.get_session_status(&id).unwrap().commands_count, 1);
            assert!(eventually(|| written.lines() == vec!["uptime"]).await);

            manager.send_command(&id, "ls").unwrap();
            assert_eq!(manager.get_session_status(&id).unwrap().commands_count, 2);
        }

        #[tokio::test]
        async fn test_blank_initial_command_is_not_counted() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let id = manager
                .create_session("web01", "bob", password(), Some("  "))
                .unwrap();
            assert_eq!(manager.get_session_status(&id).unwrap().commands_count, 0);
        }

        #[tokio::test]
        async fn test_unsent_command_is_not_recorded() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let id = connected(&manager).await;

            // Kill both tasks without touching the record, which stays `connected`
            {
                let runtime = manager.inner.runtimes.get(&id).unwrap();
                runtime.transport.abort();
                runtime.decision.abort();
            }
            assert!(
                eventually(|| manager
                    .inner
                    .runtimes
                    .get(&id)
                    .is_some_and(|rt| rt.transport.is_finished() && rt.decision.is_finished()))
                .await
            );
            assert_eq!(
                manager.get_session_status(&id).unwrap().status,
                SessionStatus::Connected
            );

            assert!(matches!(
                manager.send_command(&id, "ls"),
                Err(SessionError::Ended(_))
            ));
            assert_eq!(manager.get_session_status(&id).unwrap().commands_count, 0);
        }

        #[test]
        fn test_create_outside_runtime_fails() {
            let manager = SessionManager::new(
                fast_config(),
                Arc::new(MockConnector::hanging()),
                Arc::new(DisabledLlm),
            );
            let result = manager.create_session("web01", "bob", password(), None);
            assert!(matches!(result, Err(SessionError::Spawn(_))));
        }
    }

    mod output {
        use super::*;

        #[tokio::test]
        async fn test_reads_are_idempotent_and_since_filters() {
            let script = ubuntu_shell().on("whoami", "whoami\r\nbob\r\nbob@web01:~$ ");
            let manager = manager_with(Arc::new(MockConnector::shell(script)));
            let id = connected(&manager).await;

            let first = manager.get_session_output(&id, None).unwrap();
            let again = manager.get_session_output(&id, None).unwrap();
            assert_eq!(first.output, again.output);
            assert!(first.output.contains("Welcome to Ubuntu"));

            manager.send_command(&id, "whoami").unwrap();
            manager
                .wait_for_completion(&id, 0, Duration::from_secs(2))
                .await
                .unwrap();

            let newer = manager
                .get_session_output(&id, Some(first.read_at))
                .unwrap();
            assert!(newer.output.starts_with("whoami"));
            assert!(!newer.output.contains("Welcome"));
            assert!(newer.read_at > first.read_at);
        }
    }

    mod os_cache {
        use super::*;

        fn plain_shell() -> MockShellScript {
            MockShellScript::new().banner(PROMPT)
        }

        #[tokio::test]
        async fn test_detected_os_is_cached_per_host() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let id = connected(&manager).await;
            assert!(
                eventually(|| manager
                    .inner
                    .store
                    .cached_os("bob", "web01")
                    .is_some_and(|os| os.os_type == "Ubuntu"))
                .await
            );
            assert_eq!(
                manager.get_session_status(&id).unwrap().os_fingerprint.version,
                "22.04.3"
            );
        }

        #[tokio::test]
        async fn test_new_session_starts_with_cached_os() {
            let manager = manager_with(Arc::new(MockConnector::shell(plain_shell())));
            let ubuntu = OsFingerprint {
                os_type: "Ubuntu".to_string(),
                version: "22.04.3".to_string(),
            };
            manager.inner.store.remember_os("bob", "web01", &ubuntu);

            let id = manager
                .create_session("web01", "bob", password(), None)
                .unwrap();
            assert_eq!(manager.get_session_status(&id).unwrap().os_fingerprint, ubuntu);

            let other = manager
                .create_session("db01", "bob", password(), None)
                .unwrap();
            assert!(
                !manager
                    .get_session_status(&other)
                    .unwrap()
                    .os_fingerprint
                    .is_known()
            );
        }
    }

    mod one_shot {
        use super::*;

        #[tokio::test]
        async fn test_execute_command_returns_output_and_drops_session() {
            let script = ubuntu_shell().on(
                "df -h /",
                "df -h /\r\n/dev/sda1  40G  12G  26G  32% /\r\nbob@web01:~$ ",
            );
            let connector = Arc::new(MockConnector::shell(script));
            let written = connector.written();
            let manager = manager_with(connector);

            let run = manager
                .execute_command("web01", "bob", password(), "df -h /", Duration::from_secs(2))
                .await
                .unwrap();

            assert_eq!(run.command, "df -h /");
            assert_eq!(run.state, CommandState::Idle);
            assert!(run.output.contains("/dev/sda1  40G"));
            assert!(!run.output.contains("Welcome"));
            assert_eq!(run.os_fingerprint.os_type, "Ubuntu");
            assert_eq!(written.lines(), vec!["df -h /"]);
            assert!(manager.list_sessions().is_empty());
            assert!(manager.inner.runtimes.is_empty());
            assert!(manager.inner.store.cached_os("bob", "web01").is_some());
        }

        #[tokio::test]
        async fn test_execute_command_reports_connect_failure() {
            let manager = manager_with(Arc::new(MockConnector::failing("Connection refused")));
            let err = manager
                .execute_command("db01", "bob", password(), "uptime", Duration::from_secs(2))
                .await
                .unwrap_err();

            match err {
                SessionError::ConnectFailed { reason, .. } => {
                    assert!(reason.contains("Connection refused"))
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(manager.list_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_execute_command_times_out() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let result = manager
                .execute_command(
                    "web01",
                    "bob",
                    password(),
                    "sleep 100",
                    Duration::from_millis(200),
                )
                .await;
            assert!(matches!(result, Err(SessionError::Timeout(_, _))));
            assert!(manager.list_sessions().is_empty());
        }

        #[tokio::test]
        async fn test_blank_command_is_rejected() {
            let manager = manager_with(Arc::new(MockConnector::hanging()));
            let result = manager
                .execute_command("web01", "bob", password(), " ", Duration::from_secs(1))
                .await;
            assert!(matches!(result, Err(SessionError::EmptyCommand)));
            assert!(manager.list_sessions().is_empty());
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_close_is_prompt_and_keeps_record() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let id = connected(&manager).await;

            let started = std::time::Instant::now();
            manager.close_session(&id).await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(2));

            let status = manager.get_session_status(&id).unwrap();
            assert_eq!(status.status, SessionStatus::Closed);
            assert!(
                manager
                    .get_session_output(&id, None)
                    .unwrap()
                    .output
                    .contains("Welcome")
            );
            assert!(manager.send_command(&id, "ls").is_err());

            // Closing twice is harmless and the status stays closed
            manager.close_session(&id).await.unwrap();
            assert_eq!(
                manager.get_session_status(&id).unwrap().status,
                SessionStatus::Closed
            );
        }

        #[tokio::test]
        async fn test_tasks_stop_on_their_own() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let id = connected(&manager).await;

            let started = std::time::Instant::now();
            let exits = manager.stop_tasks(&id).await;
            assert_eq!(exits, Some((TaskExit::Stopped, TaskExit::Stopped)));
            // A few poll intervals, well under the join timeout
            assert!(started.elapsed() < Duration::from_millis(500));
            assert_eq!(manager.stop_tasks(&id).await, None);
        }

        #[tokio::test]
        async fn test_tasks_stop_while_connecting() {
            let manager = manager_with(Arc::new(MockConnector::hanging()));
            let id = manager
                .create_session("10.255.255.1", "bob", password(), None)
                .unwrap();

            let exits = manager.stop_tasks(&id).await;
            assert_eq!(exits, Some((TaskExit::Stopped, TaskExit::Stopped)));
        }

        #[tokio::test]
        async fn test_join_aborts_a_stuck_task() {
            let stuck = tokio::spawn(std::future::pending::<()>());
            let exit = join_task("s", "transport", stuck, Duration::from_millis(20)).await;
            assert_eq!(exit, TaskExit::Aborted);

            let done = tokio::spawn(async {});
            let exit = join_task("s", "decision", done, Duration::from_secs(1)).await;
            assert_eq!(exit, TaskExit::Stopped);

            let panicked = tokio::spawn(async { panic!("decision loop bug") });
            let exit = join_task("s", "decision", panicked, Duration::from_secs(1)).await;
            assert_eq!(exit, TaskExit::Failed);
        }

        #[tokio::test]
        async fn test_reaper_closes_idle_and_purges_dead_sessions() {
            let connector = Arc::new(MockConnector::shell(ubuntu_shell()));
            let manager = manager_with(connector);
            let live = connected(&manager).await;

            let dead_manager = manager_with(Arc::new(MockConnector::failing("Connection refused")));
            let dead = dead_manager
                .create_session("db01", "bob", password(), None)
                .unwrap();
            assert!(
                eventually(|| dead_manager.get_session_status(&dead).unwrap().status
                    == SessionStatus::Error)
                .await
            );

            // Nothing is old enough yet
            assert!(manager.reap_at(Utc::now()).await.is_empty());
            assert!(dead_manager.reap_at(Utc::now()).await.is_empty());

            let report = manager
                .reap_at(Utc::now() + chrono::Duration::seconds(61))
                .await;
            assert_eq!(report.closed, vec![live.clone()]);
            assert_eq!(
                manager.get_session_status(&live).unwrap().status,
                SessionStatus::Closed
            );

            // Idle past the idle limit but not the zombie limit
            assert!(
                dead_manager
                    .reap_at(Utc::now() + chrono::Duration::seconds(61))
                    .await
                    .is_empty()
            );
            let report = dead_manager
                .reap_at(Utc::now() + chrono::Duration::seconds(121))
                .await;
            assert_eq!(report.purged, vec![dead.clone()]);
            assert!(matches!(
                dead_manager.get_session_status(&dead),
                Err(SessionError::NotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_shutdown_closes_every_session() {
            let manager = manager_with(Arc::new(MockConnector::shell(ubuntu_shell())));
            let a = connected(&manager).await;
            let b = connected(&manager).await;
            assert_ne!(a, b);
            assert_eq!(manager.list_sessions().len(), 2);

            manager.shutdown().await;
            for id in [a, b] {
                assert_eq!(
                    manager.get_session_status(&id).unwrap().status,
                    SessionStatus::Closed
                );
            }
        }

        #[tokio::test]
        async fn test_reaper_task_stops_on_shutdown() {
            let manager = manager_with(Arc::new(MockConnector::hanging()));
            let reaper = manager.start_reaper();
            manager.shutdown().await;
            tokio::time::timeout(Duration::from_secs(1), reaper)
                .await
                .expect("reaper did not stop")
                .unwrap();
        }
    }
}
