//! Connection transport: the per-session task that owns the remote shell.
//!
//! ## Lifecycle
//!
//! 1. **Connect** through a [`ShellConnector`] within `connect_timeout`. On failure the
//!    session goes to `error`, a `[fatal] ...` marker is pushed to the output queue and
//!    the output history, and the stop signal is set.
//! 2. **Banner**: status becomes `connected`, then everything the server prints within
//!    `banner_wait` is forwarded as a single chunk.
//! 3. **Initial command** is written if one was given.
//! 4. **Pump** until stop: read with a `poll_interval` timeout, decode, append to the
//!    history and the output queue; then drain the input queue, writing each line
//!    followed by `\n`. The loop ends when the remote shell exits.
//! 5. **Teardown**: close the shell, record `disconnected` (clean exit) or `error`
//!    (I/O failure), set the stop signal. A `closed` status is never overwritten.
//!
//! The remote shell is abstracted behind [`RemoteShell`] so the loop can be driven by
//! the russh client in production and by scripted shells in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::mcp::channel::{InputLine, OutputEvent, TransportEnd};
use crate::mcp::decode::ChunkDecoder;
use crate::mcp::error::TransportError;
use crate::mcp::storage::SessionStore;
use crate::mcp::types::SessionStatus;

/// Where and as whom to connect.
pub struct ConnectTarget {
    /// `host` or `host:port`
    pub host: String,
    pub username: String,
    pub password: Arc<SecretString>,
}

/// Result of one bounded read.
#[derive(Debug, PartialEq, Eq)]
pub enum ShellRead {
    Data(Vec<u8>),
    /// Nothing arrived within the wait
    Idle,
    /// The remote shell exited or the channel closed
    Exited,
}

/// An open interactive shell.
#[async_trait]
pub trait RemoteShell: Send {
    /// Wait up to `wait` for output.
    async fn read(&mut self, wait: Duration) -> Result<ShellRead, TransportError>;

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the shell and the underlying connection. Errors are ignored.
    async fn close(&mut self);
}

/// Opens interactive shells.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn RemoteShell>, TransportError>;
}

/// Timing knobs for one transport task.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub banner_wait: Duration,
}

enum Outcome {
    Stopped,
    Exited,
    Failed(TransportError),
}

/// The transport task for one session.
pub struct TransportTask {
    pub session_id: String,
    pub store: Arc<SessionStore>,
    pub connector: Arc<dyn ShellConnector>,
    pub target: ConnectTarget,
    pub initial_command: Option<String>,
    pub settings: TransportSettings,
    pub end: TransportEnd,
}

impl TransportTask {
    pub async fn run(mut self) {
        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.target),
        );

        let connected = tokio::select! {
            biased;

            _ = self.end.stop.cancelled() => {
                info!("Session {} stopped while connecting", self.session_id);
                self.finish(SessionStatus::Disconnected);
                return;
            }

            result = connect => match result {
                Ok(Ok(shell)) => Ok(shell),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TransportError::ConnectTimeout(self.settings.connect_timeout)),
            },
        };

        let mut shell = match connected {
            Ok(shell) => shell,
            Err(e) => {
                self.fail_connect(e);
                return;
            }
        };

        self.store.update(&self.session_id, |r| {
            r.set_status(SessionStatus::Connected);
            r.touch(Utc::now());
        });
        info!(
            "Session {} connected to {}@{}",
            self.session_id, self.target.username, self.target.host
        );

        let mut decoder = ChunkDecoder::new();
        let outcome = self.pump(shell.as_mut(), &mut decoder).await;

        shell.close().await;
        let tail = decoder.flush();
        self.emit(tail);

        match outcome {
            Outcome::Stopped => {
                debug!("Session {} transport stopped", self.session_id);
                self.finish(SessionStatus::Disconnected);
            }
            Outcome::Exited => {
                info!("Session {} remote shell exited", self.session_id);
                self.finish(SessionStatus::Disconnected);
            }
            Outcome::Failed(e) => {
                error!("Session {} transport failed: {}", self.session_id, e);
                let marker = format!("\r\n[error] {}\r\n", e);
                self.store.update(&self.session_id, |r| {
                    r.append_output(Utc::now(), &marker);
                    r.last_error = Some(e.to_string());
                });
                let _ = self.end.output_tx.send(OutputEvent::Fatal(marker));
                self.finish(SessionStatus::Error);
            }
        }
    }

    async fn pump(&mut self, shell: &mut dyn RemoteShell, decoder: &mut ChunkDecoder) -> Outcome {
        match self.drain_banner(shell, decoder).await {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => {}
            Err(e) => return Outcome::Failed(e),
        }

        if let Some(command) = self.initial_command.take()
            && !command.trim().is_empty()
            && let Err(e) = self.write_line(shell, InputLine::Command(command)).await
        {
            return Outcome::Failed(e);
        }

        let poll = self.settings.poll_interval;
        loop {
            let read = tokio::select! {
                biased;
                _ = self.end.stop.cancelled() => return Outcome::Stopped,
                read = shell.read(poll) => read,
            };

            match read {
                Ok(ShellRead::Data(bytes)) => {
                    let text = decoder.decode(&bytes);
                    self.emit(text);
                }
                Ok(ShellRead::Idle) => {}
                Ok(ShellRead::Exited) => return Outcome::Exited,
                Err(e) => return Outcome::Failed(e),
            }

            while let Ok(line) = self.end.input_rx.try_recv() {
                if let Err(e) = self.write_line(shell, line).await {
                    return Outcome::Failed(e);
                }
            }
        }
    }

    /// Collect everything printed within `banner_wait` and forward it as one chunk.
    async fn drain_banner(
        &mut self,
        shell: &mut dyn RemoteShell,
        decoder: &mut ChunkDecoder,
    ) -> Result<Option<Outcome>, TransportError> {
        let deadline = Instant::now() + self.settings.banner_wait;
        let mut banner = Vec::new();
        let mut outcome = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(self.settings.poll_interval);

            let read = tokio::select! {
                biased;
                _ = self.end.stop.cancelled() => {
                    outcome = Some(Outcome::Stopped);
                    break;
                }
                read = shell.read(wait) => read?,
            };

            match read {
                ShellRead::Data(bytes) => banner.extend_from_slice(&bytes),
                ShellRead::Idle => {}
                ShellRead::Exited => {
                    outcome = Some(Outcome::Exited);
                    break;
                }
            }
        }

        let text = decoder.decode(&banner);
        self.emit(text);
        Ok(outcome)
    }

    async fn write_line(
        &mut self,
        shell: &mut dyn RemoteShell,
        line: InputLine,
    ) -> Result<(), TransportError> {
        if let InputLine::Command(command) = &line {
            let _ = self
                .end
                .output_tx
                .send(OutputEvent::Dispatched(command.clone()));
        }

        let mut data = line.text().as_bytes().to_vec();
        data.push(b'\n');
        shell.write(&data).await?;

        self.store
            .update(&self.session_id, |r| r.touch(Utc::now()));
        Ok(())
    }

    /// Append decoded output to the history and forward it to the decision loop.
    fn emit(&self, text: String) {
        if text.is_empty() {
            return;
        }
        self.store
            .update(&self.session_id, |r| r.append_output(Utc::now(), &text));
        let _ = self.end.output_tx.send(OutputEvent::Chunk(text));
    }

    fn fail_connect(&self, e: TransportError) {
        let kind = e.kind();
        error!(
            "Session {} failed to connect to {}@{}: {}",
            self.session_id, self.target.username, self.target.host, e
        );
        let marker = format!("[fatal] SSH connection failed: {}\r\n", e);
        self.store.update(&self.session_id, |r| {
            r.append_output(Utc::now(), &marker);
            r.last_error = Some(e.to_string());
            r.error_kind = Some(kind);
        });
        let _ = self.end.output_tx.send(OutputEvent::Fatal(marker));
        self.finish(SessionStatus::Error);
    }

    /// Record the terminal status and set the stop signal.
    fn finish(&self, status: SessionStatus) {
        let applied = self
            .store
            .update(&self.session_id, |r| r.set_status(status))
            .unwrap_or(false);
        if !applied {
            warn!(
                "Session {} kept its status instead of {}",
                self.session_id, status
            );
        }
        self.end.stop.cancel();
    }
}
