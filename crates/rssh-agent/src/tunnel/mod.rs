//! Reverse dial client
//!
//! Dials out to the controller, authenticates (retrying with an
//! interactively entered password only on an explicit authentication
//! rejection), requests a remote listener, announces the agent's
//! identity on the info side channel, and hands back a
//! [`RemoteListener`] indistinguishable from a local bind.

mod info;

pub use info::send_extra_info;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::Channel;
use russh_keys::key::PublicKey;
use thiserror::Error;
use tokio::sync::mpsc;

use rssh_core::config::{AgentConfig, Mode};
use rssh_core::ExtraInfo;

use crate::listener::{RemoteListener, SessionStream};

/// Buffered tunneled connections awaiting accept. Small: the server
/// loop drains this immediately.
const INCOMING_CHANNEL_CAPACITY: usize = 16;

/// Errors from the reverse bootstrap. Only an explicit password
/// rejection is retryable, and only via the interactive prompt.
#[derive(Debug, Error)]
pub enum DialError {
    /// The agent is not configured for reverse operation
    #[error("Not configured for reverse mode")]
    NotReverse,

    /// Outbound connection or transport failure (non-retryable)
    #[error("Failed to dial {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: russh::Error,
    },

    /// The controller rejected our password and interactive entry is
    /// not permitted
    #[error("Authentication rejected by {addr}")]
    AuthRejected { addr: String },

    /// The controller refused the remote listen request
    #[error("Controller refused to listen on port {port}")]
    ListenRefused { port: u16 },
}

/// Mutable state of the dial loop; discarded once a connection
/// succeeds or a non-retryable error occurs.
struct DialState {
    password: String,
    attempts: u32,
}

/// Dial the controller and return a listener bound on its side.
pub async fn dial_home(config: &AgentConfig) -> Result<RemoteListener, DialError> {
    let Mode::Reverse(target) = &config.mode else {
        return Err(DialError::NotReverse);
    };
    let addr = format!("{}:{}", target.host, config.port);

    let ssh_config = Arc::new(client::Config::default());
    let mut state = DialState {
        password: config.password.clone(),
        attempts: 0,
    };

    loop {
        state.attempts += 1;
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let handler = ReverseHandler::new(incoming_tx);

        let mut session = client::connect(Arc::clone(&ssh_config), addr.as_str(), handler)
            .await
            .map_err(|source| DialError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let authenticated = session
            .authenticate_password(&target.user, &state.password)
            .await
            .map_err(|source| DialError::Connect {
                addr: addr.clone(),
                source,
            })?;

        if !authenticated {
            // Explicit rejection: the only retryable failure, and only
            // when the operator is there to type a new password.
            if !config.interactive_dial() {
                return Err(DialError::AuthRejected { addr });
            }
            tracing::warn!(
                "Password rejected by {} (attempt {})",
                addr,
                state.attempts
            );
            match prompt_password().await {
                Ok(password) => state.password = password,
                Err(err) => tracing::warn!("Could not read password: {}", err),
            }
            continue;
        }

        tracing::debug!("Authenticated at {} as '{}'", addr, target.user);

        // The reply carries the port the controller actually bound,
        // which differs from the request when port 0 was asked for.
        let bound_port = match session
            .tcpip_forward("127.0.0.1", config.remote_bind_port as u32)
            .await
        {
            Ok(port) => port,
            Err(russh::Error::RequestDenied) => {
                return Err(DialError::ListenRefused {
                    port: config.remote_bind_port,
                });
            }
            Err(source) => return Err(DialError::Connect { addr, source }),
        };

        let listening_address = format!("127.0.0.1:{}", bound_port);
        tracing::info!("Success: listening at home on {}", listening_address);

        // Identity announcement; failure is logged inside, never fatal.
        send_extra_info(&session, ExtraInfo::collect(listening_address)).await;

        return Ok(RemoteListener::Reverse {
            client: session,
            incoming: incoming_rx,
        });
    }
}

/// Masked password prompt, off the async runtime.
async fn prompt_password() -> std::io::Result<String> {
    tokio::task::spawn_blocking(|| rpassword::prompt_password("Enter password: "))
        .await
        .map_err(|err| std::io::Error::other(err))?
}

/// Client-side handler for the reverse connection: trusts the
/// controller's host key (the tunnel exists to reach home, not to
/// verify it) and turns forwarded channels into session streams.
pub struct ReverseHandler {
    incoming: mpsc::Sender<(SessionStream, SocketAddr)>,
}

impl ReverseHandler {
    fn new(incoming: mpsc::Sender<(SessionStream, SocketAddr)>) -> Self {
        Self { incoming }
    }
}

#[async_trait]
impl client::Handler for ReverseHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Controller host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let peer: SocketAddr = format!("{}:{}", originator_address, originator_port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], originator_port as u16)));

        tracing::debug!(
            "Tunneled connection from {} via {}:{}",
            peer,
            connected_address,
            connected_port
        );

        let stream: SessionStream = Box::new(channel.into_stream());
        if self.incoming.send((stream, peer)).await.is_err() {
            tracing::warn!("Listener gone, dropping tunneled connection from {}", peer);
        }
        Ok(())
    }
}
