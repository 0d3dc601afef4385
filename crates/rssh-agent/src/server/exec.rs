//! Command execution sessions
//!
//! Runs a requested command with fully piped stdio. Stdin flows
//! through a buffered channel so a client that never sends EOF cannot
//! wedge the session; stdout and stderr are pumped independently and
//! the exit status is reported before the channel closes.

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::close_session;

/// Stderr goes out as extended data of this type per the SSH
/// connection protocol.
const EXTENDED_DATA_STDERR: u32 = 1;

/// Run `argv` to completion, or until the session is cancelled.
pub async fn run_command(
    handle: Handle,
    channel: ChannelId,
    argv: Vec<String>,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut child = match Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!("Could not run command '{}': {}", argv[0], err);
            let message = format!("Command execution failed: {}\r\n", err);
            let _ = handle
                .data(channel, CryptoVec::from_slice(message.as_bytes()))
                .await;
            close_session(&handle, channel, Some(1)).await;
            cancel.cancel();
            return;
        }
    };

    let stdin_task = child.stdin.take().map(|stdin| {
        tokio::spawn(pump_stdin(stdin, stdin_rx))
    });
    let stdout_task = child.stdout.take().map(|stdout| {
        let handle = handle.clone();
        tokio::spawn(async move { pump_stdout(handle, channel, stdout).await })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let handle = handle.clone();
        tokio::spawn(async move { pump_stderr(handle, channel, stderr).await })
    });

    tokio::select! {
        status = child.wait() => {
            // Let the output pumps drain what the child wrote before
            // the status goes out.
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
                Err(err) => {
                    tracing::warn!("Could not collect exit status: {}", err);
                    1
                }
            };
            tracing::debug!("Command finished with exit code {}", code);
            close_session(&handle, channel, Some(code)).await;
        }
        _ = cancel.cancelled() => {
            tracing::info!("Session terminated, killing command");
            let _ = child.start_kill();
            if let Some(task) = stdin_task {
                task.abort();
            }
            if let Some(task) = stdout_task {
                task.abort();
            }
            if let Some(task) = stderr_task {
                task.abort();
            }
            // Reap the killed child; no exit status is reported.
            let _ = child.wait().await;
        }
    }
    cancel.cancel();
}

async fn pump_stdin(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if stdin.write_all(&data).await.is_err() {
            break;
        }
    }
    // Sender dropped or write failed: closing stdin delivers EOF.
}

async fn pump_stdout(handle: Handle, channel: ChannelId, mut stdout: tokio::process::ChildStdout) {
    let mut buf = [0u8; 4096];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if handle
                    .data(channel, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn pump_stderr(handle: Handle, channel: ChannelId, mut stderr: tokio::process::ChildStderr) {
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if handle
                    .extended_data(channel, EXTENDED_DATA_STDERR, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
