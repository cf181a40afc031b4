//! Password-based SSH authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use secrecy::{ExposeSecret, SecretString};

use crate::mcp::error::TransportError;
use crate::mcp::session::SshClientHandler;

use super::traits::AuthStrategy;

/// `password` method authentication.
pub struct PasswordAuth {
    password: Arc<SecretString>,
}

impl PasswordAuth {
    pub fn new(password: Arc<SecretString>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        let result = handle
            .authenticate_password(username, self.password.expose_secret())
            .await
            .map_err(|e| TransportError::Auth(format!("Password authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
