//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::mcp::error::TransportError;
use crate::mcp::session::SshClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) so a chain can be moved into
/// the transport task.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Credentials rejected
    /// * `Err(TransportError::Auth)` - Protocol error during the attempt
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError>;

    /// Used for logging.
    fn name(&self) -> &'static str;
}
