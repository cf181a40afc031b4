//! LLM collaborator interface.
//!
//! The session manager only needs plain chat completions: a list of role/content
//! messages in, one string out. [`OpenAiCompatClient`] speaks the OpenAI-compatible
//! `/chat/completions` API (DeepSeek by default); [`DisabledLlm`] is used when no API key
//! is configured so every caller falls back to its canned behavior.
//!
//! Model replies are free text. [`extract_json_object`] and [`extract_json_array`] pull the
//! first JSON block out of a reply on a best-effort basis and return `None` otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mcp::config::LlmSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM is not configured")]
    Disabled,

    #[error("LLM request failed: {0}")]
    Http(String),

    #[error("LLM API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed LLM response: {0}")]
    Malformed(String),

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    /// Errors worth retrying: network failures, rate limits, server errors, timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(_) | LlmError::Timeout(_) => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Disabled | LlmError::Malformed(_) => false,
        }
    }
}

/// Chat-completion collaborator shared by every session.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], temperature: f32) -> Result<String, LlmError>;

    /// Used for logging.
    fn name(&self) -> &'static str;
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct OpenAiCompatClient {
    base_url: String,
    model: String,
    api_key: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;

        Ok(Self {
            base_url,
            model: model.into(),
            api_key,
            timeout,
            client,
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(&self, messages: &[ChatMessage], temperature: f32) -> Result<String, LlmError> {
        let request = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        });

        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        match body["choices"][0]["message"]["content"].as_str() {
            Some(content) => {
                debug!("LLM reply ({} chars)", content.len());
                Ok(content.to_string())
            }
            None => Err(LlmError::Malformed("no content in response".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

/// Stand-in used when no API key is configured.
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    async fn chat(&self, _messages: &[ChatMessage], _temperature: f32) -> Result<String, LlmError> {
        Err(LlmError::Disabled)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Build the collaborator from settings. Missing keys or client build failures
/// yield [`DisabledLlm`].
pub fn client_from_settings(settings: LlmSettings) -> Arc<dyn LlmClient> {
    let Some(api_key) = settings.api_key else {
        info!("LLM_API_KEY not set; prompt suggestions use canned answers");
        return Arc::new(DisabledLlm);
    };

    match OpenAiCompatClient::new(settings.base_url, settings.model, api_key, settings.timeout) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Failed to build LLM client, disabling suggestions: {}", e);
            Arc::new(DisabledLlm)
        }
    }
}

/// First `{...}` block in `text` that parses as a JSON object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// First `[...]` block in `text` that parses as a JSON array.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    mod messages {
        use super::*;

        #[test]
        fn test_serializes_openai_shape() {
            let json = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
            assert_eq!(json, serde_json::json!({"role": "system", "content": "be brief"}));
        }

        #[test]
        fn test_constructors() {
            assert_eq!(ChatMessage::user("x").role, Role::User);
            assert_eq!(ChatMessage::assistant("y").role, Role::Assistant);
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn test_transient_classification() {
            assert!(LlmError::Http("reset".to_string()).is_transient());
            assert!(LlmError::Timeout(Duration::from_secs(1)).is_transient());
            assert!(
                LlmError::Status {
                    status: 429,
                    body: String::new()
                }
                .is_transient()
            );
            assert!(
                LlmError::Status {
                    status: 503,
                    body: String::new()
                }
                .is_transient()
            );
            assert!(
                !LlmError::Status {
                    status: 401,
                    body: String::new()
                }
                .is_transient()
            );
            assert!(!LlmError::Disabled.is_transient());
            assert!(!LlmError::Malformed("x".to_string()).is_transient());
        }
    }

    mod json_extraction {
        use super::*;

        #[test]
        fn test_object_inside_prose() {
            let map = extract_json_object("Sure! {\"response\": \"y\"} hope that helps").unwrap();
            assert_eq!(map["response"], "y");
        }

        #[test]
        fn test_object_missing() {
            assert!(extract_json_object("just y").is_none());
            assert!(extract_json_object("} {").is_none());
            assert!(extract_json_object("{not json}").is_none());
        }

        #[test]
        fn test_array_inside_code_fence() {
            let items =
                extract_json_array("```json\n[\"apt update\", \"apt install -y nginx\"]\n```")
                    .unwrap();
            assert_eq!(items.len(), 2);
            assert_eq!(items[1], "apt install -y nginx");
        }

        #[test]
        fn test_array_missing_or_invalid() {
            assert!(extract_json_array("no commands").is_none());
            assert!(extract_json_array("[unterminated").is_none());
        }
    }

    mod disabled {
        use super::*;

        #[tokio::test]
        async fn test_always_errors() {
            let llm = DisabledLlm;
            let result = llm.chat(&[ChatMessage::user("hi")], 0.3).await;
            assert!(matches!(result, Err(LlmError::Disabled)));
            assert_eq!(llm.name(), "disabled");
        }

        #[test]
        fn test_missing_key_builds_disabled_client() {
            let llm = client_from_settings(LlmSettings {
                api_key: None,
                base_url: "http://localhost".to_string(),
                model: "m".to_string(),
                timeout: Duration::from_secs(1),
            });
            assert_eq!(llm.name(), "disabled");
        }

        #[test]
        fn test_key_builds_http_client() {
            let llm = client_from_settings(LlmSettings {
                api_key: Some(SecretString::from("sk-test".to_string())),
                base_url: "http://localhost:9/".to_string(),
                model: "m".to_string(),
                timeout: Duration::from_secs(1),
            });
            assert_eq!(llm.name(), "openai-compatible");
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
