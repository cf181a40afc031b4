//! Authentication chain for trying multiple strategies.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use secrecy::SecretString;
use tracing::debug;

use crate::mcp::error::TransportError;
use crate::mcp::session::SshClientHandler;

use super::traits::AuthStrategy;
use super::{KeyboardInteractiveAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// Strategies are tried in the order they were added. The first successful
/// authentication stops the chain and returns success.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain used for session logins: `password`, then `keyboard-interactive`.
    pub fn for_password(password: Arc<SecretString>) -> Self {
        Self::new()
            .with_password(password.clone())
            .with_keyboard_interactive(password)
    }

    pub fn with_password(mut self, password: Arc<SecretString>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_keyboard_interactive(mut self, password: Arc<SecretString>) -> Self {
        self.strategies
            .push(Box::new(KeyboardInteractiveAuth::new(password)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        if self.strategies.is_empty() {
            return Err(TransportError::Auth(
                "No authentication strategies configured".to_string(),
            ));
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!(
                        "Authentication succeeded with strategy: {}",
                        strategy.name()
                    );
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication rejected with strategy: {}", strategy.name());
                    last_error = Some(TransportError::Auth(format!(
                        "{} authentication rejected",
                        strategy.name()
                    )));
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::Auth("All authentication methods failed".to_string())
        }))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
