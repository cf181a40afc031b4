//! Decision loop: the per-session task that reads shell output and reacts to it.
//!
//! # Command state machine
//!
//! ```text
//!            dispatch                 prompt return
//!   idle ──────────────> running ─────────────────────> idle
//!                         │   ^ \
//!          confirmation   │   │  \ error pattern
//!                         v   │   v
//!            waiting_for_response  error ── prompt return ──> (error kept, command finished)
//! ```
//!
//! The loop is the only writer of `command_state`. It learns about caller commands from
//! [`OutputEvent::Dispatched`], which the transport emits right before writing them, so
//! a prompt printed before the write can never finish the new command.
//!
//! # Reactions
//!
//! Each chunk is classified once (see [`crate::mcp::patterns`]) and handled by its
//! first matching class:
//!
//! - **Credential**: type the stored password, at most [`MAX_CREDENTIAL_ATTEMPTS`] times
//!   per command; after that the prompt is escalated.
//! - **Confirmation**: ask [`crate::mcp::suggest`] for an answer; empty answers are
//!   escalated.
//! - **Error**: `running -> error`, remember the error lines, escalate.
//! - **Success**: logged.
//! - **PromptReturn**: `running | waiting_for_response -> idle`.
//!
//! A command is counted as finished when a chunk ends in a shell prompt. Completion is
//! published on a `watch` channel so callers can wait for it.
//!
//! Classification runs on the previous chunk's unterminated last line joined with the
//! new chunk, so prompts split across two reads are still recognized.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::mcp::channel::{DecisionEnd, InputLine, OutputEvent};
use crate::mcp::llm::{ChatMessage, LlmClient};
use crate::mcp::patterns::{
    Classification, analyze_result, classify, detect_os, ends_with_prompt, extract_error_message,
    strip_ansi,
};
use crate::mcp::storage::SessionStore;
use crate::mcp::suggest::{ContextBuffer, ContextEntry, SuggestionRequest, suggest_response};
use crate::mcp::types::{CommandProgress, CommandState, OsFingerprint};

/// Password replies per command before prompts are escalated instead
pub const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Entries from the rolling buffer handed to the suggestion step
pub(crate) const SUGGESTION_CONTEXT: usize = 10;

/// OS detection is skipped for windows shorter than this
const MIN_OS_DETECT_LEN: usize = 20;

/// Longest unterminated line carried into the next window
const MAX_CARRY_CHARS: usize = 512;

/// Shown in the context buffer instead of the password
const PASSWORD_PLACEHOLDER: &str = "<password>";

/// Local analysis state. Visible fields are mirrored into the session record.
#[derive(Debug, Default)]
struct Scratch {
    current_command: Option<String>,
    command_state: CommandState,
    context: ContextBuffer,
    os: OsFingerprint,
    in_flight: bool,
    credential_attempts: u32,
    carry: String,
    finished: u64,
    command_output: String,
}

/// The decision task for one session.
pub struct DecisionLoop {
    session_id: String,
    store: Arc<SessionStore>,
    llm: Arc<dyn LlmClient>,
    password: Arc<SecretString>,
    llm_timeout: Duration,
    end: DecisionEnd,
    progress: watch::Sender<CommandProgress>,
    state: Scratch,
}

impl DecisionLoop {
    /// Build the loop and the receiver side of its progress channel.
    pub fn new(
        session_id: String,
        store: Arc<SessionStore>,
        llm: Arc<dyn LlmClient>,
        password: Arc<SecretString>,
        llm_timeout: Duration,
        end: DecisionEnd,
    ) -> (Self, watch::Receiver<CommandProgress>) {
        let (progress, progress_rx) = watch::channel(CommandProgress::default());
        let os = store
            .read(&session_id, |r| r.os_fingerprint().clone())
            .unwrap_or_default();
        let decision = Self {
            session_id,
            store,
            llm,
            password,
            llm_timeout,
            end,
            progress,
            state: Scratch {
                os,
                ..Scratch::default()
            },
        };
        (decision, progress_rx)
    }

    pub async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.end.stop.cancelled() => break,
                event = self.end.output_rx.recv() => event,
            };

            match event {
                Some(OutputEvent::Dispatched(command)) => self.on_dispatch(command),
                Some(OutputEvent::Chunk(text)) => self.on_chunk(text).await,
                Some(OutputEvent::Fatal(marker)) => self.on_fatal(&marker),
                None => break,
            }
        }
        debug!("Session {} decision loop exited", self.session_id);
    }

    fn on_dispatch(&mut self, command: String) {
        debug!("Session {} running: {}", self.session_id, command);
        if self.state.in_flight {
            debug!(
                "Session {} dispatched a command before the previous one returned",
                self.session_id
            );
        }
        self.state
            .context
            .push(ContextEntry::Input(command.clone()));
        self.state.current_command = Some(command);
        self.state.command_state = CommandState::Running;
        self.state.in_flight = true;
        self.state.credential_attempts = 0;
        self.state.command_output.clear();
        self.state.carry.clear();
        self.mirror();
    }

    async fn on_chunk(&mut self, text: String) {
        let window = format!("{}{}", self.state.carry, text);
        let class = classify(&window);

        self.state.context.push(ContextEntry::Output(text.clone()));
        if self.state.in_flight {
            self.state.command_output.push_str(&text);
        }
        self.detect_os(&window);

        match class {
            Classification::Credential => self.answer_credential(),
            Classification::Confirmation => self.answer_confirmation(&window).await,
            Classification::Error => self.on_error(&window),
            Classification::Success => {
                debug!("Session {} reported success", self.session_id);
            }
            Classification::PromptReturn => {
                self.return_to_idle();
            }
            Classification::None => {}
        }

        let prompt_returned = match class {
            Classification::PromptReturn => true,
            Classification::Error | Classification::Success | Classification::None => {
                ends_with_prompt(&window)
            }
            Classification::Credential | Classification::Confirmation => false,
        };
        if prompt_returned {
            self.return_to_idle();
            if self.state.in_flight {
                self.finish_command();
            }
        }

        self.state.carry = if class == Classification::None {
            unterminated_tail(&window)
        } else {
            String::new()
        };
        self.mirror();
    }

    fn detect_os(&mut self, window: &str) {
        if self.state.os.is_known() || window.len() <= MIN_OS_DETECT_LEN {
            return;
        }
        if let Some(observed) = detect_os(window)
            && self.state.os.merge(&observed)
        {
            info!("Session {} OS detected: {}", self.session_id, self.state.os);
            self.store.record_os(&self.session_id, &self.state.os);
        }
    }

    fn answer_credential(&mut self) {
        if self.state.credential_attempts >= MAX_CREDENTIAL_ATTEMPTS {
            warn!(
                "Session {} still asking for a password after {} attempts",
                self.session_id, self.state.credential_attempts
            );
            self.escalate(format!(
                "Password prompt repeated after {} automatic attempts; the stored password \
                 is probably wrong for `{}`",
                self.state.credential_attempts,
                self.state.current_command.as_deref().unwrap_or("login"),
            ));
            return;
        }

        self.state.credential_attempts += 1;
        debug!(
            "Session {} answering password prompt (attempt {})",
            self.session_id, self.state.credential_attempts
        );
        self.reply(self.password.expose_secret().to_string(), PASSWORD_PLACEHOLDER);
    }

    async fn answer_confirmation(&mut self, window: &str) {
        if self.state.command_state == CommandState::Running {
            self.state.command_state = CommandState::WaitingForResponse;
            self.mirror();
        }

        let prompt = last_lines(&strip_ansi(window), 3);
        let request = SuggestionRequest {
            os: self.state.os.clone(),
            current_command: self.state.current_command.clone(),
            command_state: self.state.command_state,
            recent: self.state.context.recent(SUGGESTION_CONTEXT),
            prompt: prompt.clone(),
        };

        let answer = tokio::select! {
            biased;
            _ = self.end.stop.cancelled() => return,
            answer = suggest_response(self.llm.as_ref(), &request, self.llm_timeout) => answer,
        };

        if answer.is_empty() {
            info!(
                "Session {} has no answer for prompt {:?}",
                self.session_id, prompt
            );
            self.escalate(format!("Terminal is waiting for input:\n{}", prompt));
            return;
        }

        debug!("Session {} answering confirmation with {:?}", self.session_id, answer);
        self.reply(answer.clone(), &answer);
        if self.state.command_state == CommandState::WaitingForResponse {
            self.state.command_state = CommandState::Running;
        }
    }

    fn on_error(&mut self, window: &str) {
        if self.state.command_state != CommandState::Running {
            return;
        }
        self.state.command_state = CommandState::Error;

        let message = extract_error_message(window)
            .unwrap_or_else(|| last_lines(&strip_ansi(window), 3));
        warn!("Session {} command failed: {}", self.session_id, message);

        let recorded = message.clone();
        self.store
            .update(&self.session_id, |r| r.last_error = Some(recorded));
        self.escalate(format!(
            "Command `{}` failed:\n{}",
            self.state.current_command.as_deref().unwrap_or(""),
            message
        ));
    }

    fn on_fatal(&mut self, marker: &str) {
        self.escalate(format!("Session ended: {}", marker.trim()));
        if self.state.in_flight {
            self.state.command_state = CommandState::Error;
            self.state.in_flight = false;
            self.mirror();
        }
    }

    fn return_to_idle(&mut self) {
        if matches!(
            self.state.command_state,
            CommandState::Running | CommandState::WaitingForResponse
        ) {
            self.state.command_state = CommandState::Idle;
        }
    }

    fn finish_command(&mut self) {
        self.state.in_flight = false;
        self.state.finished += 1;
        self.state.credential_attempts = 0;

        let output = std::mem::take(&mut self.state.command_output);
        self.store.update(&self.session_id, |r| {
            r.last_command_output = Some(output.clone());
        });
        if let Some(command) = self.state.current_command.clone()
            && let Some(hint) = analyze_result(&command, &output)
        {
            self.escalate(hint);
        }
        debug!(
            "Session {} command finished ({} so far, state {})",
            self.session_id, self.state.finished, self.state.command_state
        );
    }

    /// Queue an automatic answer. `shown` is what the context buffer records.
    fn reply(&mut self, text: String, shown: &str) {
        if self.end.input_tx.send(InputLine::Reply(text)).is_err() {
            debug!("Session {} transport gone; reply dropped", self.session_id);
            return;
        }
        self.state
            .context
            .push(ContextEntry::Input(shown.to_string()));
    }

    fn escalate(&self, message: String) {
        let content = format!("[{}] {}", self.session_id, message);
        self.store.update(&self.session_id, |r| {
            r.context.push(ChatMessage::user(content));
            r.touch(Utc::now());
        });
    }

    /// Copy visible fields into the record and publish progress.
    fn mirror(&self) {
        let state = self.state.command_state;
        let finished = self.state.finished;
        let current = self.state.current_command.clone();
        self.store.update(&self.session_id, |r| {
            r.command_state = state;
            r.current_command = current;
            r.commands_finished = finished;
        });
        self.progress.send_replace(CommandProgress { state, finished });
    }
}

/// Text after the last newline, bounded to [`MAX_CARRY_CHARS`].
fn unterminated_tail(window: &str) -> String {
    let tail = match window.rfind('\n') {
        Some(pos) => &window[pos + 1..],
        None => window,
    };
    let count = tail.chars().count();
    tail.chars()
        .skip(count.saturating_sub(MAX_CARRY_CHARS))
        .collect()
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
