//! SSH client handler
//!
//! Implements the russh server handler: public-key authentication against
//! the single authorized key, and translation of `direct-tcpip` channel
//! opens into manager events.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, MethodSet};
use russh_keys::key::PublicKey;

use jg_core::{BoxedChannelIo, ChannelOpen, RejectReason};

use crate::auth::AuthPolicy;
use crate::manager::Manager;

/// Handler for a single SSH client connection.
pub struct ClientHandler {
    /// Authentication policy shared by all connections.
    auth: Arc<AuthPolicy>,
    /// Manager the accepted channels are submitted to.
    manager: Manager,
}

impl ClientHandler {
    /// Create a new client handler.
    pub fn new(auth: Arc<AuthPolicy>, manager: Manager) -> Self {
        Self { auth, manager }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Handle public key authentication.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.auth.allows(user, public_key) {
            tracing::info!("authentication successful for user {:?}", user);
            Ok(Auth::Accept)
        } else {
            tracing::warn!(
                "authentication rejected for user {:?}, key {}",
                user,
                public_key.fingerprint()
            );
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    /// Session channels are refused; only forwarding channels are served.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("refusing session channel");
        Ok(false)
    }

    /// Hand a direct-tcpip open to the manager.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "direct-tcpip open for {}:{} (originator {}:{})",
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port
        );

        let event = DirectTcpip {
            channel,
            target: host_to_connect.to_string(),
            port: port_to_connect,
        };
        self.manager.submit(Box::new(event)).await;
        Ok(true)
    }
}

/// A direct-tcpip channel open, adapted to the manager's seam.
///
/// russh confirms the channel at the SSH layer once the handler returns,
/// so a core-level rejection surfaces to the client as an immediate
/// close; the typed reason stays in the server log.
struct DirectTcpip {
    channel: Channel<Msg>,
    target: String,
    port: u32,
}

#[async_trait]
impl ChannelOpen for DirectTcpip {
    fn kind(&self) -> &str {
        "direct-tcpip"
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn port(&self) -> u32 {
        self.port
    }

    async fn accept(self: Box<Self>) -> io::Result<BoxedChannelIo> {
        Ok(Box::new(self.channel.into_stream()))
    }

    async fn reject(self: Box<Self>, reason: RejectReason, message: &str) {
        tracing::info!(
            "rejecting channel for {:?}: {} ({})",
            self.target,
            message,
            reason
        );
        let _ = self.channel.close().await;
    }
}

/// Configuration for the SSH server.
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration.
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Create a new server configuration with the given host key.
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.methods = MethodSet::PUBLICKEY;
        config.auth_rejection_time = std::time::Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
