//! SSH server side of the agent
//!
//! One [`SessionHandler`] per incoming connection, driven by
//! `russh::server::run_stream` over whatever stream the
//! [`RemoteListener`] produced — a TCP socket in listen mode or a
//! forwarded channel in reverse mode.

pub mod exec;
pub mod forward;
pub mod handler;

pub use handler::SessionHandler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::Handle;
use russh::{ChannelId, MethodSet};
use russh_keys::key::KeyPair;

use rssh_core::{AgentConfig, Policy};

use crate::listener::RemoteListener;

/// Report an exit status (when there is one) and close the channel.
/// Every session termination path funnels through here exactly once.
pub(crate) async fn close_session(handle: &Handle, channel: ChannelId, exit_code: Option<u32>) {
    if let Some(code) = exit_code {
        let _ = handle.exit_status_request(channel, code).await;
    }
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

/// The agent's SSH server: host key, accepted auth methods, and the
/// per-connection accept loop.
pub struct AgentServer {
    config: Arc<AgentConfig>,
    policy: Policy,
    ssh: Arc<russh::server::Config>,
}

impl AgentServer {
    pub fn new(config: Arc<AgentConfig>) -> Result<Self> {
        // An ephemeral host key per process, like the original: the
        // agent is authenticated by what it knows, not by who it is.
        let host_key =
            KeyPair::generate_ed25519().context("Failed to generate ed25519 host key")?;

        let mut ssh = russh::server::Config::default();
        ssh.keys.push(host_key);
        ssh.methods = MethodSet::PASSWORD | MethodSet::PUBLICKEY;
        ssh.auth_rejection_time = Duration::from_secs(1);
        ssh.auth_rejection_time_initial = Some(Duration::ZERO);

        Ok(Self {
            policy: Policy::new(config.deny_exec),
            config,
            ssh: Arc::new(ssh),
        })
    }

    pub fn ssh_config(&self) -> Arc<russh::server::Config> {
        Arc::clone(&self.ssh)
    }

    /// Build a connection handler for a peer. Exposed so tests can
    /// drive the handler over an in-memory stream.
    pub fn handler(&self, peer: SocketAddr) -> SessionHandler {
        SessionHandler::new(Arc::clone(&self.config), self.policy.clone(), peer)
    }

    /// Accept connections until the listener fails. Each connection
    /// runs in its own task; a connection ending cancels everything
    /// scoped to it and nothing else.
    pub async fn serve(&self, mut listener: RemoteListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    // In reverse mode this sends a proper disconnect
                    // to the controller before we go away.
                    listener.close().await;
                    return Err(err);
                }
            };
            tracing::info!("New connection from {}", peer);

            let config = self.ssh_config();
            let handler = self.handler(peer);

            tokio::spawn(async move {
                let session = match russh::server::run_stream(config, stream, handler).await {
                    Ok(session) => session,
                    Err(err) => {
                        tracing::warn!("Connection from {} failed to set up: {}", peer, err);
                        return;
                    }
                };
                match session.await {
                    Ok(()) => tracing::info!("Connection from {} closed", peer),
                    Err(err) => {
                        tracing::warn!("Connection from {} closed with error: {}", peer, err)
                    }
                }
            });
        }
    }
}
