//! Context-aware answers for confirmation prompts.
//!
//! The decision loop hands over what it knows about the session (OS, current command,
//! recent traffic) plus the prompt text. The LLM collaborator proposes the literal text
//! to type, which then passes a guardrail:
//!
//! - yes/no prompts only accept `y`, `n`, `yes` or `no`; anything else becomes `y`
//! - a reply wrapped in a JSON object uses its `response` field
//! - LLM failures fall back to `y` for yes/no prompts and to an empty answer otherwise
//!
//! An empty answer means "do not type anything"; the decision loop escalates instead.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::mcp::llm::{ChatMessage, LlmClient, LlmError, extract_json_object};
use crate::mcp::patterns::is_yes_no_prompt;
use crate::mcp::types::{CommandState, OsFingerprint};

/// Entries kept in the decision loop's rolling buffer
pub const CONTEXT_BUFFER_LIMIT: usize = 20;

/// Longest entry copied into a prompt, in characters
const MAX_ENTRY_CHARS: usize = 500;

const SUGGESTION_TEMPERATURE: f32 = 0.3;

const YES_NO_ANSWERS: &[&str] = &["y", "n", "yes", "no"];

/// One item of recent session traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEntry {
    /// Text written to the shell (commands and automatic replies)
    Input(String),
    /// Output received from the shell
    Output(String),
}

impl ContextEntry {
    fn render(&self) -> String {
        match self {
            ContextEntry::Input(text) => format!(">> {}", tail_chars(text, MAX_ENTRY_CHARS)),
            ContextEntry::Output(text) => format!("> {}", tail_chars(text, MAX_ENTRY_CHARS)),
        }
    }
}

/// Rolling buffer of recent traffic, capped at [`CONTEXT_BUFFER_LIMIT`].
#[derive(Debug, Default)]
pub struct ContextBuffer {
    entries: VecDeque<ContextEntry>,
}

impl ContextBuffer {
    pub fn push(&mut self, entry: ContextEntry) {
        if self.entries.len() == CONTEXT_BUFFER_LIMIT {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The newest `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ContextEntry> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the suggestion step gets to see.
#[derive(Debug, Clone)]
pub struct SuggestionRequest {
    pub os: OsFingerprint,
    pub current_command: Option<String>,
    pub command_state: CommandState,
    pub recent: Vec<ContextEntry>,
    pub prompt: String,
}

pub fn build_messages(request: &SuggestionRequest) -> Vec<ChatMessage> {
    let system = format!(
        "You are operating an interactive SSH terminal.\n\
         Remote OS: {} {}\n\
         Current command: {}\n\
         Command state: {}\n\
         Reply with exactly the text to type at the prompt and nothing else.",
        request.os.os_type,
        request.os.version,
        request.current_command.as_deref().unwrap_or("(none)"),
        request.command_state,
    );

    let history: Vec<String> = request.recent.iter().map(ContextEntry::render).collect();
    let mut user = String::new();
    if !history.is_empty() {
        user.push_str("Recent terminal activity:\n");
        user.push_str(&history.join("\n"));
        user.push_str("\n\n");
    }
    user.push_str("The terminal is now waiting at this prompt:\n");
    user.push_str(&tail_chars(&request.prompt, MAX_ENTRY_CHARS));
    user.push_str("\n\nOnly output the text to type.");

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// Turn a raw LLM reply into the text to type.
pub fn apply_guardrail(prompt: &str, reply: &str) -> String {
    let candidate = extract_json_object(reply)
        .and_then(|map| map.get("response").and_then(|v| v.as_str()).map(str::to_string))
        .unwrap_or_else(|| reply.to_string());
    let candidate = candidate.trim().trim_matches('`').trim().to_string();

    if is_yes_no_prompt(prompt) {
        let lower = candidate.to_lowercase();
        if YES_NO_ANSWERS.contains(&lower.as_str()) {
            return lower;
        }
        debug!("Discarding non yes/no suggestion {:?}", candidate);
        return "y".to_string();
    }

    candidate
}

/// Canned answer used when the LLM is unavailable.
pub fn fallback_response(prompt: &str) -> String {
    if is_yes_no_prompt(prompt) {
        "y".to_string()
    } else {
        String::new()
    }
}

/// Ask the LLM for an answer, bounded by `timeout`. Never fails.
pub async fn suggest_response(
    llm: &dyn LlmClient,
    request: &SuggestionRequest,
    timeout: Duration,
) -> String {
    let messages = build_messages(request);

    let result = match tokio::time::timeout(timeout, llm.chat(&messages, SUGGESTION_TEMPERATURE))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout)),
    };

    match result {
        Ok(reply) => apply_guardrail(&request.prompt, &reply),
        Err(LlmError::Disabled) => fallback_response(&request.prompt),
        Err(e) => {
            warn!("Suggestion via {} failed: {}", llm.name(), e);
            fallback_response(&request.prompt)
        }
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
