//! Test doubles for the remote shell and the LLM collaborator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::mcp::config::ManagerConfig;
use crate::mcp::error::TransportError;
use crate::mcp::llm::{ChatMessage, LlmClient, LlmError};
use crate::mcp::transport::{ConnectTarget, RemoteShell, ShellConnector, ShellRead};

/// Poll `check` every 10ms for up to 2s.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Timings small enough for tests.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        connect_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        banner_wait: Duration::from_millis(20),
        join_timeout: Duration::from_secs(1),
        step_timeout: Duration::from_secs(2),
        llm_timeout: Duration::from_millis(200),
        ..ManagerConfig::default()
    }
}

/// Everything the scripted shells received, shared across connections.
#[derive(Clone, Default)]
pub struct Written(Arc<Mutex<Vec<u8>>>);

impl Written {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }

    fn extend(&self, data: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(data);
    }
}

/// Behavior of a scripted shell.
#[derive(Clone, Default)]
pub struct MockShellScript {
    banner: Vec<String>,
    rules: Vec<(String, String)>,
    exit_on: Option<String>,
    fail_writes: bool,
}

impl MockShellScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output available right after connecting.
    pub fn banner(mut self, text: &str) -> Self {
        self.banner.push(text.to_string());
        self
    }

    /// Print `reply` whenever the line `input` is written.
    pub fn on(mut self, input: &str, reply: &str) -> Self {
        self.rules.push((input.to_string(), reply.to_string()));
        self
    }

    /// Report the shell as exited once `input` is written.
    pub fn exit_on(mut self, input: &str) -> Self {
        self.exit_on = Some(input.to_string());
        self
    }

    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

enum Mode {
    Fail(String),
    Hang,
    Shell(MockShellScript),
}

pub struct MockConnector {
    mode: Mode,
    written: Written,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn failing(message: &str) -> Self {
        Self::with_mode(Mode::Fail(message.to_string()))
    }

    pub fn hanging() -> Self {
        Self::with_mode(Mode::Hang)
    }

    pub fn shell(script: MockShellScript) -> Self {
        Self::with_mode(Mode::Shell(script))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            written: Written::default(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn written(&self) -> Written {
        self.written.clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn connect(&self, _target: &ConnectTarget) -> Result<Box<dyn RemoteShell>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            Mode::Fail(message) => Err(TransportError::Connect(message.clone())),
            Mode::Hang => std::future::pending().await,
            Mode::Shell(script) => Ok(Box::new(MockShell {
                pending: script.banner.iter().cloned().collect(),
                script: script.clone(),
                partial: String::new(),
                exited: false,
                written: self.written.clone(),
            })),
        }
    }
}

struct MockShell {
    pending: VecDeque<String>,
    script: MockShellScript,
    partial: String,
    exited: bool,
    written: Written,
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn read(&mut self, wait: Duration) -> Result<ShellRead, TransportError> {
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(ShellRead::Data(chunk.into_bytes()));
        }
        if self.exited {
            return Ok(ShellRead::Exited);
        }
        tokio::time::sleep(wait).await;
        Ok(ShellRead::Idle)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.script.fail_writes {
            return Err(TransportError::Io("broken pipe".to_string()));
        }
        self.written.extend(data);
        self.partial.push_str(&String::from_utf8_lossy(data));

        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']).to_string();

            if self.script.exit_on.as_deref() == Some(line.as_str()) {
                self.exited = true;
            }
            if let Some((_, reply)) = self.script.rules.iter().find(|(input, _)| *input == line) {
                self.pending.push_back(reply.clone());
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.exited = true;
    }
}

/// LLM double returning scripted replies in order.
pub struct MockLlm {
    replies: Mutex<VecDeque<String>>,
    hang: bool,
    failures: AtomicUsize,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlm {
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            hang: false,
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::replies(Vec::<String>::new())
        }
    }

    /// Fail the first `failures` calls with a transient HTTP error.
    pub fn flaky<I, S>(failures: usize, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::replies(replies)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages of every call so far.
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(&self, messages: &[ChatMessage], _temperature: f32) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(messages.to_vec());
        if self.hang {
            return std::future::pending().await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LlmError::Http("connection reset".to_string()));
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Malformed("no scripted reply".to_string()))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
