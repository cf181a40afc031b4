//! Keyboard-interactive SSH authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::mcp::error::TransportError;
use crate::mcp::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Upper bound on info-request rounds before giving up
const MAX_ROUNDS: usize = 5;

/// `keyboard-interactive` authentication that answers every prompt with the password.
///
/// Rounds with no prompts (banners, instructions) are answered with an empty list.
pub struct KeyboardInteractiveAuth {
    password: Arc<SecretString>,
}

impl KeyboardInteractiveAuth {
    pub fn new(password: Arc<SecretString>) -> Self {
        Self { password }
    }

    fn answers(&self, prompt_count: usize) -> Vec<String> {
        let password = self.password.expose_secret();
        (0..prompt_count).map(|_| password.to_string()).collect()
    }
}

#[async_trait]
impl AuthStrategy for KeyboardInteractiveAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| {
                TransportError::Auth(format!("Keyboard-interactive authentication failed: {}", e))
            })?;

        for round in 0..MAX_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    debug!(
                        "Keyboard-interactive round {} with {} prompt(s)",
                        round + 1,
                        prompts.len()
                    );
                    response = handle
                        .authenticate_keyboard_interactive_respond(self.answers(prompts.len()))
                        .await
                        .map_err(|e| {
                            TransportError::Auth(format!(
                                "Keyboard-interactive response failed: {}",
                                e
                            ))
                        })?;
                }
            }
        }

        Ok(matches!(response, KeyboardInteractiveAuthResponse::Success))
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }
}
