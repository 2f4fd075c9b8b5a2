//! SSH server listener
//!
//! Accepts incoming client connections and runs one handler task per
//! connection until the cancel token fires. Connections are numbered so
//! channel activity in the log can be tied back to the client that
//! opened it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthPolicy;
use crate::manager::Manager;
use crate::server::handler::{ClientHandler, ServerConfig};

/// SSH server that listens for incoming client connections.
pub struct SshServer {
    /// Server configuration.
    config: ServerConfig,
    /// Authentication policy.
    auth: Arc<AuthPolicy>,
    /// Manager handling accepted channels.
    manager: Manager,
    /// Cancellation token for graceful shutdown.
    cancel: CancellationToken,
}

impl SshServer {
    /// Create a new SSH server.
    pub fn new(
        host_key: KeyPair,
        auth: Arc<AuthPolicy>,
        manager: Manager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config: ServerConfig::new(host_key),
            auth,
            manager,
            cancel,
        }
    }

    /// Accept connections until the cancel token fires.
    ///
    /// Each connection gets its own task; the listener never waits on a
    /// handshake, so a stalled client cannot hold up the accept loop.
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind to {}", bind_addr))?;
        tracing::info!("listening for SSH clients on {}", listener.local_addr()?);

        let mut next_conn: u64 = 1;
        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("listener closing");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("accept failed: {}", e);
                        continue;
                    }
                },
            };

            let conn = next_conn;
            next_conn += 1;
            tracing::info!("connection {} from {}", conn, peer_addr);

            let config = Arc::clone(&self.config.ssh_config);
            let handler = ClientHandler::new(Arc::clone(&self.auth), self.manager.clone());
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("connection {} dropped at shutdown", conn);
                    }
                    result = russh::server::run_stream(config, socket, handler) => match result {
                        Ok(_) => {
                            tracing::info!("connection {} ({}) closed", conn, peer_addr);
                        }
                        Err(e) => {
                            // Handshake and auth failures land here; the
                            // client is gone either way.
                            tracing::warn!("connection {} ({}) failed: {}", conn, peer_addr, e);
                        }
                    },
                }
            });
        }
    }
}

/// Load the host key from a PEM file.
pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load host key from {:?}", path))
}
