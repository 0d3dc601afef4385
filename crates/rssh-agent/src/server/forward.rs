//! Port-forward relays
//!
//! Local (direct-tcpip) forwards connect out from the agent; remote
//! (tcpip-forward) forwards bind a listener on the agent and push each
//! accepted connection back to the client as a forwarded channel. Both
//! relays are plain bidirectional byte copies scoped to their
//! connection's cancellation token.

use std::net::SocketAddr;

use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Relay one direct-tcpip channel to its target.
pub async fn local_forward(
    channel: Channel<Msg>,
    host: String,
    port: u32,
    cancel: CancellationToken,
) {
    let addr = format!("{}:{}", host, port);
    let mut target = match TcpStream::connect(&addr).await {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!("Could not connect to {}: {}", addr, err);
            let _ = channel.close().await;
            return;
        }
    };

    let mut stream = channel.into_stream();
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut stream, &mut target) => {
            match result {
                Ok((to_target, to_client)) => tracing::debug!(
                    "Forward to {} done ({} out, {} in)",
                    addr,
                    to_target,
                    to_client
                ),
                Err(err) => tracing::debug!("Forward to {} ended: {}", addr, err),
            }
        }
        _ = cancel.cancelled() => {
            tracing::debug!("Forward to {} cancelled", addr);
        }
    }
}

/// Accept connections for a granted tcpip-forward and relay each back
/// to the client until the forward is cancelled.
pub async fn serve_remote_forward(
    handle: Handle,
    listener: TcpListener,
    address: String,
    port: u32,
    cancel: CancellationToken,
) {
    tracing::info!("Forwarding {}:{}", address, port);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("Forward listener on port {} failed: {}", port, err);
                        break;
                    }
                };
                let handle = handle.clone();
                let address = address.clone();
                let cancel = cancel.clone();
                tokio::spawn(relay_remote(handle, socket, peer, address, port, cancel));
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Forward listener on port {} closed", port);
                break;
            }
        }
    }
}

async fn relay_remote(
    handle: Handle,
    mut socket: TcpStream,
    peer: SocketAddr,
    address: String,
    port: u32,
    cancel: CancellationToken,
) {
    let channel = match handle
        .channel_open_forwarded_tcpip(address, port, peer.ip().to_string(), peer.port() as u32)
        .await
    {
        Ok(channel) => channel,
        Err(err) => {
            tracing::warn!("Client refused forwarded connection from {}: {}", peer, err);
            return;
        }
    };

    let mut stream = channel.into_stream();
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut socket, &mut stream) => {
            if let Err(err) = result {
                tracing::debug!("Forwarded connection from {} ended: {}", peer, err);
            }
        }
        _ = cancel.cancelled() => {}
    }
}
