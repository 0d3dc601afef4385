//! Interactive shell sessions on a pseudo-terminal
//!
//! The shell runs on a real pty so line editing, signals and job
//! control behave the way a local terminal would. The pty's blocking
//! reader and writer live on the blocking pool; the supervisor task
//! bridges them to the SSH channel, applies window resizes, and
//! reports the shell's exit status exactly once.

#[cfg(windows)]
pub mod legacy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use rssh_core::AgentConfig;

use crate::server::close_session;

/// How long to wait for a pump task to drain after the shell exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Pty parameters captured from the client's pty request.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// A window-change event.
#[derive(Debug, Clone, Copy)]
pub struct PtyResize {
    pub cols: u16,
    pub rows: u16,
}

/// A shell freshly spawned on its pty.
struct SpawnedShell {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn std::io::Read + Send>,
    writer: Box<dyn std::io::Write + Send>,
}

fn spawn_program(argv: &[String], request: &PtyRequest) -> Result<SpawnedShell> {
    let pty = native_pty_system();
    let pair = pty
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open pty")?;

    let mut cmd = CommandBuilder::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.env("TERM", &request.term);

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("Failed to spawn '{}'", argv[0]))?;
    // The master keeps the pty alive; the slave is the child's now.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .context("Failed to clone pty reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("Failed to take pty writer")?;

    Ok(SpawnedShell {
        master: pair.master,
        child,
        reader,
        writer,
    })
}

/// Run one pty session to completion: the configured shell, or a
/// requested command when one was supplied alongside the pty request.
pub async fn run_session(
    handle: Handle,
    channel: ChannelId,
    config: Arc<AgentConfig>,
    request: PtyRequest,
    command: Option<Vec<String>>,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    resize_rx: mpsc::Receiver<PtyResize>,
    cancel: CancellationToken,
) {
    let argv = command.unwrap_or_else(|| vec![config.shell.clone()]);
    let shell = match spawn_program(&argv, &request) {
        Ok(shell) => shell,
        Err(err) => {
            // The pipe fallback is a shell host; commands get the
            // error reported in-band like a failed exec.
            #[cfg(windows)]
            if argv[0] == config.shell {
                legacy::run_fallback(handle, channel, config, stdin_rx, cancel, err).await;
                return;
            }
            tracing::warn!("Could not start '{}': {:#}", argv[0], err);
            let message = format!("Could not start '{}': {}\r\n", argv[0], err);
            let _ = handle
                .data(channel, CryptoVec::from_slice(message.as_bytes()))
                .await;
            close_session(&handle, channel, Some(1)).await;
            cancel.cancel();
            return;
        }
    };
    tracing::info!("'{}' started on pty", argv[0]);
    bridge(handle, channel, shell, stdin_rx, resize_rx, cancel).await;
}

/// Bridge the pty to the SSH channel until the shell exits or the
/// session is cancelled.
async fn bridge(
    handle: Handle,
    channel: ChannelId,
    shell: SpawnedShell,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
    mut resize_rx: mpsc::Receiver<PtyResize>,
    cancel: CancellationToken,
) {
    let SpawnedShell {
        master,
        mut child,
        mut reader,
        mut writer,
    } = shell;
    let mut killer = child.clone_killer();

    // Client keystrokes into the pty. Ends when the channel closes.
    let writer_task = tokio::task::spawn_blocking(move || {
        use std::io::Write;
        while let Some(data) = stdin_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    // Pty output into an async channel; the blocking read unblocks
    // when the master side is dropped.
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let reader_task = tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let pump_handle = handle.clone();
    let pump_task = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if pump_handle
                .data(channel, CryptoVec::from_slice(&data))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let (exit_tx, mut exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = exit_tx.send(child.wait());
    });

    loop {
        tokio::select! {
            exit = &mut exit_rx => {
                let code = match exit {
                    Ok(Ok(status)) => status.exit_code(),
                    Ok(Err(err)) => {
                        tracing::warn!("Could not collect shell exit status: {}", err);
                        1
                    }
                    Err(_) => 1,
                };
                tracing::info!("Session ended normally, exit code {}", code);
                // Dropping the master unblocks the reader so the last
                // output drains before the status goes out.
                drop(master);
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader_task).await;
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, pump_task).await;
                close_session(&handle, channel, Some(code)).await;
                cancel.cancel();
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;
                return;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Session terminated by peer, killing shell");
                let _ = killer.kill();
                drop(master);
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader_task).await;
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, pump_task).await;
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;
                return;
            }
            Some(resize) = resize_rx.recv() => {
                let result = master.resize(PtySize {
                    rows: resize.rows,
                    cols: resize.cols,
                    pixel_width: 0,
                    pixel_height: 0,
                });
                if let Err(err) = result {
                    tracing::warn!("Could not resize pty: {:#}", err);
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request() -> PtyRequest {
        PtyRequest {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_spawn_shell_reports_exit_code() {
        let mut shell = spawn_program(&argv(&["/bin/sh"]), &request()).expect("spawn /bin/sh");
        {
            use std::io::Write;
            shell.writer.write_all(b"exit 3\n").unwrap();
            shell.writer.flush().unwrap();
        }
        let status = shell.child.wait().expect("wait on shell");
        assert_eq!(status.exit_code(), 3);
    }

    #[test]
    fn test_spawned_command_gets_the_pty_as_stdin() {
        let mut shell = spawn_program(&argv(&["/bin/sh", "-c", "test -t 0"]), &request())
            .expect("spawn command");
        let status = shell.child.wait().expect("wait on command");
        assert_eq!(status.exit_code(), 0, "stdin must be the pty");
    }

    #[test]
    fn test_spawn_missing_shell_fails() {
        assert!(spawn_program(&argv(&["/definitely/not/a/shell"]), &request()).is_err());
    }

    #[test]
    fn test_resize_live_pty() {
        let shell = spawn_program(&argv(&["/bin/sh"]), &request()).expect("spawn /bin/sh");
        shell
            .master
            .resize(PtySize {
                rows: 50,
                cols: 132,
                pixel_width: 0,
                pixel_height: 0,
            })
            .expect("resize");
        let mut killer = shell.child.clone_killer();
        let _ = killer.kill();
    }
}
