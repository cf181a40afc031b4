//! SSH client connection logic.
//!
//! This module implements [`ShellConnector`] and [`RemoteShell`] over russh:
//!
//! ## Connection Lifecycle
//!
//! 1. **Address Parsing**: Parse the server address into host and port components.
//!    Supports `host:port` format with default port 22 if not specified.
//!
//! 2. **Client Configuration**: Build the russh client configuration with keepalive
//!    and compression settings. Sessions are persistent, so there is no inactivity
//!    timeout; the reaper closes idle sessions instead.
//!
//! 3. **Connection Establishment**: Establish the TCP connection and SSH handshake.
//!    The overall bound is applied by the transport task.
//!
//! 4. **Authentication**: `password`, then `keyboard-interactive` via [`AuthChain`].
//!
//! 5. **Interactive Shell**: Open a session channel, request an `xterm` PTY and a
//!    login shell. Output is read as raw bytes; stdout and stderr are merged the way a
//!    terminal shows them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client};
use tracing::{debug, info};

use crate::mcp::auth::{AuthChain, AuthStrategy};
use crate::mcp::config::resolve_compression;
use crate::mcp::error::TransportError;
use crate::mcp::session::SshClientHandler;
use crate::mcp::transport::{ConnectTarget, RemoteShell, ShellConnector, ShellRead};

/// Terminal type requested for the PTY
const TERM: &str = "xterm";
const PTY_COLUMNS: u32 = 200;
const PTY_ROWS: u32 = 50;

/// Build russh client configuration.
///
/// Creates an `Arc<client::Config>` with:
/// - No inactivity timeout (sessions are long-lived)
/// - Keepalive interval of 30 seconds with max 3 keepalives
/// - Compression preference based on `compress` flag (ZLIB if enabled, NONE if disabled)
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Parse address string into host and port components.
///
/// Supports the following formats:
/// - `host:port` - Returns the specified host and port
/// - `host` - Returns the host with default SSH port (22)
///
/// Uses `rsplit_once` to handle bracketed IPv6 addresses (e.g., `[::1]:22`).
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), TransportError> {
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| TransportError::Connect(format!("Invalid port number: {}", e)))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), 22))
    }
}

/// Opens interactive shells with russh.
pub struct RusshConnector {
    compress: bool,
}

impl RusshConnector {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    /// Compression from `SSH_COMPRESSION` (default on).
    pub fn from_env() -> Self {
        Self::new(resolve_compression(None))
    }
}

#[async_trait]
impl ShellConnector for RusshConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn RemoteShell>, TransportError> {
        let (host, port) = parse_address(&target.host)?;
        let config = build_client_config(self.compress);

        debug!("Connecting to {}:{}", host, port);
        let mut handle = client::connect(config, (host.as_str(), port), SshClientHandler)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let auth_chain = AuthChain::for_password(target.password.clone());
        if !auth_chain.authenticate(&mut handle, &target.username).await? {
            return Err(TransportError::Auth(
                "no authentication methods succeeded".to_string(),
            ));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to open channel: {}", e)))?;

        channel
            .request_pty(false, TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to request shell: {}", e)))?;

        info!(
            "Interactive shell opened for {}@{}:{}",
            target.username, host, port
        );

        Ok(Box::new(RusshShell { handle, channel }))
    }
}

/// Map one channel message to a read result.
///
/// `Eof` and `ExitStatus` can arrive before the last `Data`, so only `Close` or the end
/// of the channel stream count as the shell being gone.
fn shell_read(msg: Option<ChannelMsg>) -> ShellRead {
    match msg {
        Some(ChannelMsg::Data { data }) => ShellRead::Data(data.to_vec()),
        Some(ChannelMsg::ExtendedData { data, .. }) => ShellRead::Data(data.to_vec()),
        Some(ChannelMsg::ExitStatus { exit_status }) => {
            debug!("Remote shell exited with status {}", exit_status);
            ShellRead::Idle
        }
        Some(ChannelMsg::Eof) => {
            debug!("Remote shell sent EOF");
            ShellRead::Idle
        }
        Some(ChannelMsg::Close) | None => ShellRead::Exited,
        Some(_) => ShellRead::Idle,
    }
}

/// Interactive shell on a russh session channel.
pub struct RusshShell {
    handle: client::Handle<SshClientHandler>,
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn read(&mut self, wait: Duration) -> Result<ShellRead, TransportError> {
        // `Channel::wait` only pulls from an internal queue, so dropping it on timeout
        // loses nothing.
        let msg = match tokio::time::timeout(wait, self.channel.wait()).await {
            Ok(msg) => msg,
            Err(_) => return Ok(ShellRead::Idle),
        };

        Ok(shell_read(msg))
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| TransportError::Io(format!("Failed to write to channel: {}", e)))
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}
