//! Listener abstraction over bind and reverse mode
//!
//! The server loop only ever sees a [`RemoteListener`]; whether a
//! session arrives on a locally bound socket or through a channel
//! forwarded back over the reverse tunnel is invisible downstream.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::tunnel::ReverseHandler;

/// Byte stream carrying one incoming connection.
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionIo for T {}

/// A boxed session stream, either a TCP socket or a tunneled channel.
pub type SessionStream = Box<dyn SessionIo>;

/// Source of incoming sessions. Exactly one exists per running agent;
/// it is owned by the run loop and closed when that loop ends.
pub enum RemoteListener {
    /// Locally bound socket (listen mode)
    Local(TcpListener),
    /// Connections forwarded back through the reverse tunnel. The
    /// client handle is kept alive here; dropping the listener tears
    /// the tunnel down.
    Reverse {
        client: russh::client::Handle<ReverseHandler>,
        incoming: mpsc::Receiver<(SessionStream, SocketAddr)>,
    },
}

impl RemoteListener {
    /// Bind a local listener.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        Ok(RemoteListener::Local(listener))
    }

    /// The locally bound address, when there is one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            RemoteListener::Local(listener) => listener.local_addr().ok(),
            RemoteListener::Reverse { .. } => None,
        }
    }

    /// Accept the next incoming session stream.
    ///
    /// Identical semantics in both modes: resolves once a peer
    /// connection is ready, errors when the listener is gone.
    pub async fn accept(&mut self) -> Result<(SessionStream, SocketAddr)> {
        match self {
            RemoteListener::Local(listener) => {
                let (socket, peer) = listener
                    .accept()
                    .await
                    .context("Failed to accept connection")?;
                Ok((Box::new(socket), peer))
            }
            RemoteListener::Reverse { incoming, .. } => incoming
                .recv()
                .await
                .context("Reverse tunnel closed by controller"),
        }
    }

    /// Close the listener. In reverse mode this disconnects from the
    /// controller; in listen mode dropping the socket is enough.
    pub async fn close(self) {
        if let RemoteListener::Reverse { client, .. } = self {
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "shutting down", "en")
                .await;
        }
    }
}
