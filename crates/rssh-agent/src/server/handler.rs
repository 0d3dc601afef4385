//! Per-connection session handler
//!
//! Implements the russh server handler: authentication against the
//! configured credentials, the session dispatcher (pty / exec / hold),
//! resize and stdin routing into the running session tasks, the
//! receiving end of the info side channel, and the port-forward hooks
//! behind the policy gate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rssh_core::auth;
use rssh_core::info::{ExtraInfo, INFO_ACK_TOKEN, INFO_REQUEST_PREFIX};
use rssh_core::policy::SessionRequest;
use rssh_core::{AgentConfig, Policy};

use crate::pty::{self, PtyRequest, PtyResize};
use crate::server::{exec, forward};

/// Stdin bytes buffered per session before the transport is
/// backpressured.
const STDIN_CHANNEL_CAPACITY: usize = 64;

/// Resize events buffered per session; applied in arrival order.
const RESIZE_CHANNEL_CAPACITY: usize = 32;

/// State of one session channel. The disposition is decided once, at
/// the shell or exec request, and never re-evaluated.
struct SessionState {
    /// Pty parameters, stored when the pty request arrives
    pty: Option<PtyRequest>,
    /// Feeds the running session task's stdin; dropped on EOF
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Feeds resize events to the pty supervisor
    resize_tx: Option<mpsc::Sender<PtyResize>>,
    /// Scopes every task of this session; fired on channel close
    cancel: CancellationToken,
    /// A session reaches exactly one disposition
    dispatched: bool,
}

/// Handler for a single authenticated connection.
pub struct SessionHandler {
    config: Arc<AgentConfig>,
    policy: Policy,
    peer: SocketAddr,
    /// Username from the successful auth exchange
    user: String,
    /// Scopes everything belonging to this connection
    conn_cancel: CancellationToken,
    /// Per-channel session state
    sessions: HashMap<ChannelId, SessionState>,
    /// Active remote-forward listeners, keyed by requested addr/port
    remote_forwards: HashMap<(String, u32), CancellationToken>,
}

impl SessionHandler {
    pub fn new(config: Arc<AgentConfig>, policy: Policy, peer: SocketAddr) -> Self {
        Self {
            config,
            policy,
            peer,
            user: String::new(),
            conn_cancel: CancellationToken::new(),
            sessions: HashMap::new(),
            remote_forwards: HashMap::new(),
        }
    }

    /// Receiving end of the info side channel: log the announced
    /// identity, answer with the ack token, then reject the request —
    /// the rejection is the acknowledgment the sender waits for.
    fn handle_extra_info(&self, channel: ChannelId, data: &[u8], session: &mut Session) {
        match ExtraInfo::from_request(data) {
            Some(info) => tracing::info!("New connection from {}: {}", self.peer, info),
            None => tracing::warn!("Could not parse extra info from {}", self.peer),
        }
        session.data(channel, CryptoVec::from_slice(INFO_ACK_TOKEN.as_bytes()));
        session.channel_failure(channel);
    }

    /// Mark a session as dispatched, refusing a second disposition.
    fn begin_dispatch(&mut self, channel: ChannelId) -> Option<&mut SessionState> {
        let state = self.sessions.get_mut(&channel)?;
        if state.dispatched {
            tracing::warn!("Session {:?} already dispatched, refusing request", channel);
            return None;
        }
        state.dispatched = true;
        Some(state)
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        // Connection gone: cancel every session task and forward
        // relay scoped to it. Other connections are unaffected.
        self.conn_cancel.cancel();
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if auth::verify_password(&self.config.password, password) {
            tracing::info!(
                "Successful authentication with password from {}@{}",
                user,
                self.peer
            );
            self.user = user.to_string();
            Ok(Auth::Accept)
        } else {
            tracing::warn!("Invalid password from {}@{}", user, self.peer);
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if auth::verify_public_key(self.config.authorized_key.as_deref(), public_key) {
            tracing::info!(
                "Successful authentication with ssh key from {}@{}",
                user,
                self.peer
            );
            self.user = user.to_string();
            Ok(Auth::Accept)
        } else {
            tracing::warn!("Invalid ssh key from {}@{}", user, self.peer);
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Session channel opened: {:?}", channel.id());
        self.sessions.insert(
            channel.id(),
            SessionState {
                pty: None,
                stdin_tx: None,
                resize_tx: None,
                cancel: self.conn_cancel.child_token(),
                dispatched: false,
            },
        );
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.sessions.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let (Ok(cols), Ok(rows)) = (u16::try_from(col_width), u16::try_from(row_height)) else {
            tracing::warn!(
                "Refusing pty with out-of-range dimensions {}x{}",
                col_width,
                row_height
            );
            session.channel_failure(channel);
            return Ok(());
        };
        tracing::debug!("PTY requested: TERM={} {}x{}", term, cols, rows);
        state.pty = Some(PtyRequest {
            term: term.to_string(),
            cols,
            rows,
        });
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (Ok(cols), Ok(rows)) = (u16::try_from(col_width), u16::try_from(row_height)) else {
            tracing::warn!(
                "Ignoring out-of-range window change {}x{}",
                col_width,
                row_height
            );
            return Ok(());
        };
        if let Some(state) = self.sessions.get(&channel) {
            if let Some(resize_tx) = &state.resize_tx {
                let _ = resize_tx.send(PtyResize { cols, rows }).await;
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.policy.allow_session(SessionRequest::Shell) {
            session.channel_failure(channel);
            return Ok(());
        }
        tracing::info!("New login from {}@{}", self.user, self.peer);

        let handle = session.handle();
        let config = Arc::clone(&self.config);
        let Some(state) = self.begin_dispatch(channel) else {
            session.channel_failure(channel);
            return Ok(());
        };

        match state.pty.clone() {
            Some(request) => {
                let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
                let (resize_tx, resize_rx) = mpsc::channel(RESIZE_CHANNEL_CAPACITY);
                state.stdin_tx = Some(stdin_tx);
                state.resize_tx = Some(resize_tx);
                let cancel = state.cancel.clone();

                session.channel_success(channel);
                tokio::spawn(pty::run_session(
                    handle, channel, config, request, None, stdin_rx, resize_rx, cancel,
                ));
            }
            None => {
                // No pty, no command: keep the session open for port
                // forwarding until the peer goes away.
                tracing::debug!("No PTY requested, holding session open");
                session.channel_success(channel);
                session.data(
                    channel,
                    CryptoVec::from_slice(b"Remote forwarding available...\r\n"),
                );
                let cancel = state.cancel.clone();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    tracing::debug!("Held session {:?} terminated", channel);
                });
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Info side channel first: it is transport metadata, not a
        // command, and is answered even in deny-all deployments.
        if data.starts_with(INFO_REQUEST_PREFIX.as_bytes()) {
            self.handle_extra_info(channel, data, session);
            return Ok(());
        }

        if !self.policy.allow_session(SessionRequest::Exec) {
            session.channel_failure(channel);
            return Ok(());
        }

        let raw = String::from_utf8_lossy(data).to_string();
        tracing::info!(
            "Command execution requested by {}@{}: '{}'",
            self.user,
            self.peer,
            raw
        );

        let argv = match shlex::split(&raw) {
            Some(argv) if !argv.is_empty() => argv,
            _ => {
                tracing::warn!("Could not parse command line '{}'", raw);
                session.channel_failure(channel);
                return Ok(());
            }
        };

        let handle = session.handle();
        let config = Arc::clone(&self.config);
        let Some(state) = self.begin_dispatch(channel) else {
            session.channel_failure(channel);
            return Ok(());
        };

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        state.stdin_tx = Some(stdin_tx);
        let cancel = state.cancel.clone();

        match state.pty.clone() {
            // A requested pty wins the dispatch: the command runs with
            // the pty as its controlling terminal.
            Some(request) => {
                let (resize_tx, resize_rx) = mpsc::channel(RESIZE_CHANNEL_CAPACITY);
                state.resize_tx = Some(resize_tx);
                session.channel_success(channel);
                tokio::spawn(pty::run_session(
                    handle,
                    channel,
                    config,
                    request,
                    Some(argv),
                    stdin_rx,
                    resize_rx,
                    cancel,
                ));
            }
            None => {
                session.channel_success(channel);
                tokio::spawn(exec::run_command(handle, channel, argv, stdin_rx, cancel));
            }
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.policy.allow_session(SessionRequest::Subsystem) {
            tracing::warn!("Subsystem '{}' not supported", name);
        }
        session.channel_failure(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get(&channel) {
            if let Some(stdin_tx) = &state.stdin_tx {
                // Buffered hand-off; a full buffer backpressures the
                // transport instead of blocking the session task.
                let _ = stdin_tx.send(data.to_vec()).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.get_mut(&channel) {
            // Dropping the sender closes the child's stdin.
            state.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.sessions.remove(&channel) {
            state.cancel.cancel();
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self
            .policy
            .allow_local_forward(host_to_connect, port_to_connect)
        {
            return Ok(false);
        }
        tracing::debug!(
            "direct-tcpip from {}:{} to {}:{}",
            originator_address,
            originator_port,
            host_to_connect,
            port_to_connect
        );
        tokio::spawn(forward::local_forward(
            channel,
            host_to_connect.to_string(),
            port_to_connect,
            self.conn_cancel.child_token(),
        ));
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.policy.allow_remote_forward(address, *port) {
            return Ok(false);
        }
        let Ok(bind_port) = u16::try_from(*port) else {
            tracing::warn!("Refusing forward for out-of-range port {}", *port);
            return Ok(false);
        };

        let bind_host = if address.is_empty() { "0.0.0.0" } else { address };
        let listener = match TcpListener::bind((bind_host, bind_port)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!("Could not bind {}:{}: {}", bind_host, port, err);
                return Ok(false);
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port() as u32,
            Err(_) => *port,
        };
        *port = bound_port;

        let cancel = self.conn_cancel.child_token();
        self.remote_forwards
            .insert((address.to_string(), bound_port), cancel.clone());
        tokio::spawn(forward::serve_remote_forward(
            session.handle(),
            listener,
            address.to_string(),
            bound_port,
            cancel,
        ));
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.remote_forwards.remove(&(address.to_string(), port)) {
            Some(cancel) => {
                tracing::info!("Cancelled forwarding for {}:{}", address, port);
                cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
