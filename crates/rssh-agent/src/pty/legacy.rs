//! Pipe-based shell fallback for hosts without a working pty
//!
//! When the pty cannot be allocated and a custom shell is configured,
//! the shell runs over plain pipes instead: no line editing or echo,
//! output translated to CRLF so the client's terminal stays readable.
//! With the stock shell the session is refused outright, matching the
//! behavior a client would see from a missing shell binary.

use std::process::Stdio;
use std::sync::Arc;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rssh_core::config::default_shell;
use rssh_core::AgentConfig;

use crate::server::close_session;

/// Run the pipe-based fallback, or refuse the session when no custom
/// shell is configured.
pub async fn run_fallback(
    handle: Handle,
    channel: ChannelId,
    config: Arc<AgentConfig>,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    pty_err: anyhow::Error,
) {
    tracing::warn!("Could not allocate pty: {:#}", pty_err);

    if config.shell == default_shell() {
        let _ = handle
            .data(
                channel,
                CryptoVec::from_slice(b"Interactive shell unavailable on this host\r\n"),
            )
            .await;
        close_session(&handle, channel, Some(1)).await;
        cancel.cancel();
        return;
    }

    tracing::info!("Falling back to pipe mode for '{}'", config.shell);
    let mut child = match Command::new(&config.shell)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!("Could not start shell '{}': {}", config.shell, err);
            let message = format!("Could not start shell: {}\r\n", err);
            let _ = handle
                .data(channel, CryptoVec::from_slice(message.as_bytes()))
                .await;
            close_session(&handle, channel, Some(1)).await;
            cancel.cancel();
            return;
        }
    };

    let stdin_task = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
        })
    });
    let stdout_task = child.stdout.take().map(|stdout| {
        let handle = handle.clone();
        tokio::spawn(async move { pump_crlf(handle, channel, stdout).await })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let handle = handle.clone();
        tokio::spawn(async move { pump_crlf(handle, channel, stderr).await })
    });

    tokio::select! {
        status = child.wait() => {
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            if let Some(task) = stdin_task {
                task.abort();
            }
            let code = match status {
                Ok(status) => status.code().unwrap_or(1) as u32,
                Err(_) => 1,
            };
            tracing::info!("Session ended normally, exit code {}", code);
            close_session(&handle, channel, Some(code)).await;
        }
        _ = cancel.cancelled() => {
            tracing::info!("Session terminated by peer, killing shell");
            let _ = child.start_kill();
            for task in [stdin_task, stdout_task, stderr_task].into_iter().flatten() {
                task.abort();
            }
        }
    }
    cancel.cancel();
}

/// Copy process output to the channel, expanding bare LF to CRLF.
async fn pump_crlf<R: tokio::io::AsyncRead + Unpin>(handle: Handle, channel: ChannelId, mut src: R) {
    let mut buf = [0u8; 4096];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut out = Vec::with_capacity(n + 16);
                let mut last_cr = false;
                for &byte in &buf[..n] {
                    if byte == b'\n' && !last_cr {
                        out.push(b'\r');
                    }
                    out.push(byte);
                    last_cr = byte == b'\r';
                }
                if handle
                    .data(channel, CryptoVec::from_slice(&out))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
