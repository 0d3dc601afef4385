//! End-to-end session tests
//!
//! Drives the full server stack over an in-memory duplex stream with a
//! real russh client on the other end: authentication, command
//! execution, the info side channel, deny mode and interactive shells.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use tokio::time::timeout;

use rssh_agent::{tunnel, AgentServer, RemoteListener};
use rssh_core::config::default_password;
use rssh_core::info::{ExtraInfo, INFO_ACK_TOKEN};
use rssh_core::{AgentConfig, Mode, Target};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TrustingClient;

#[async_trait]
impl client::Handler for TrustingClient {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Wire a server instance to a fresh client over an in-memory stream.
async fn connect(config: AgentConfig) -> client::Handle<TrustingClient> {
    let server = AgentServer::new(Arc::new(config)).expect("server setup");
    let peer: SocketAddr = "127.0.0.1:45678".parse().unwrap();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let ssh_config = server.ssh_config();
    let handler = server.handler(peer);
    tokio::spawn(async move {
        if let Ok(session) = russh::server::run_stream(ssh_config, server_io, handler).await {
            let _ = session.await;
        }
    });

    client::connect_stream(Arc::new(client::Config::default()), client_io, TrustingClient)
        .await
        .expect("client handshake")
}

async fn authenticate(session: &mut client::Handle<TrustingClient>) {
    let ok = session
        .authenticate_password("tester", default_password())
        .await
        .expect("auth exchange");
    assert!(ok, "default password must be accepted");
}

/// What one session channel produced before it closed.
#[derive(Default)]
struct SessionOutcome {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    failed: bool,
}

async fn drain(channel: &mut russh::Channel<client::Msg>) -> SessionOutcome {
    let mut outcome = SessionOutcome::default();
    loop {
        let msg = timeout(TEST_TIMEOUT, channel.wait())
            .await
            .expect("session must make progress");
        match msg {
            Some(ChannelMsg::Data { data }) => outcome.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                outcome.stderr.extend_from_slice(&data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                outcome.exit_status = Some(exit_status)
            }
            Some(ChannelMsg::Failure) => {
                outcome.failed = true;
                return outcome;
            }
            Some(ChannelMsg::Close) | None => return outcome,
            Some(_) => {}
        }
    }
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let mut session = connect(AgentConfig::default()).await;
    let ok = timeout(
        TEST_TIMEOUT,
        session.authenticate_password("tester", "not-the-password"),
    )
    .await
    .expect("auth must complete")
    .expect("auth exchange");
    assert!(!ok);
}

#[tokio::test]
async fn test_default_password_is_accepted() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_captures_output_and_status() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel.exec(true, "echo hi").await.expect("exec request");
    let outcome = drain(&mut channel).await;

    assert!(!outcome.failed);
    assert_eq!(outcome.exit_status, Some(0));
    assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "hi");
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_reports_nonzero_exit() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .exec(true, "sh -c 'exit 7'")
        .await
        .expect("exec request");
    let outcome = drain(&mut channel).await;

    assert_eq!(outcome.exit_status, Some(7));
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_routes_stderr_as_extended_data() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .exec(true, "ls /definitely-not-a-real-directory")
        .await
        .expect("exec request");
    let outcome = drain(&mut channel).await;

    assert_ne!(outcome.exit_status, Some(0));
    assert!(!outcome.stderr.is_empty(), "error text must go to stderr");
}

#[tokio::test]
async fn test_exec_spawn_failure_is_reported_in_band() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .exec(true, "/definitely/missing/binary")
        .await
        .expect("exec request");
    let outcome = drain(&mut channel).await;

    assert_eq!(outcome.exit_status, Some(1));
    assert!(
        String::from_utf8_lossy(&outcome.stdout).contains("Command execution failed"),
        "spawn failure must be reported to the client"
    );
}

#[tokio::test]
async fn test_deny_mode_refuses_exec() {
    let config = AgentConfig {
        deny_exec: true,
        ..Default::default()
    };
    let mut session = connect(config).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel.exec(true, "echo hi").await.expect("exec request");
    let outcome = drain(&mut channel).await;

    assert!(outcome.failed, "deny mode must refuse command execution");
    assert!(outcome.stdout.is_empty());
}

#[tokio::test]
async fn test_info_request_is_acked_then_rejected() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let info = ExtraInfo::collect("127.0.0.1:8888".to_string());
    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .exec(true, info.to_request())
        .await
        .expect("info request");
    let outcome = drain(&mut channel).await;

    assert!(outcome.failed, "info request must be rejected");
    assert_eq!(outcome.stdout, INFO_ACK_TOKEN.as_bytes());
}

#[tokio::test]
async fn test_info_request_is_answered_even_in_deny_mode() {
    let config = AgentConfig {
        deny_exec: true,
        ..Default::default()
    };
    let mut session = connect(config).await;
    authenticate(&mut session).await;

    let info = ExtraInfo::collect("127.0.0.1:8888".to_string());
    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .exec(true, info.to_request())
        .await
        .expect("info request");
    let outcome = drain(&mut channel).await;

    assert_eq!(outcome.stdout, INFO_ACK_TOKEN.as_bytes());
}

#[cfg(unix)]
#[tokio::test]
async fn test_pty_shell_runs_and_reports_exit() {
    let config = AgentConfig {
        shell: "/bin/sh".to_string(),
        ..Default::default()
    };
    let mut session = connect(config).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .expect("pty request");
    channel.request_shell(true).await.expect("shell request");
    channel.data(&b"exit 5\n"[..]).await.expect("send input");

    let outcome = drain(&mut channel).await;
    assert_eq!(outcome.exit_status, Some(5));
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_with_pty_runs_on_a_terminal() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .expect("pty request");
    channel
        .exec(true, "sh -c 'test -t 0'")
        .await
        .expect("exec request");
    let outcome = drain(&mut channel).await;

    assert!(!outcome.failed);
    assert_eq!(
        outcome.exit_status,
        Some(0),
        "a requested pty must be the command's stdin"
    );
}

#[cfg(unix)]
fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
#[tokio::test]
async fn test_channel_close_kills_running_command() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .exec(true, "sh -c 'echo $$; exec sleep 30'")
        .await
        .expect("exec request");

    // First line of output is the pid of what becomes the sleep.
    let mut out = Vec::new();
    let pid = loop {
        let msg = timeout(TEST_TIMEOUT, channel.wait())
            .await
            .expect("pid must arrive");
        match msg {
            Some(ChannelMsg::Data { data }) => {
                out.extend_from_slice(&data);
                if let Some(pos) = out.iter().position(|&b| b == b'\n') {
                    break String::from_utf8_lossy(&out[..pos]).trim().to_string();
                }
            }
            Some(_) => {}
            None => panic!("channel closed before any output"),
        }
    };
    assert!(process_alive(&pid), "sleep must be running before the close");

    channel.close().await.expect("close channel");

    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while process_alive(&pid) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "closing the channel must kill the running command"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_oversized_pty_dimensions_are_refused() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel
        .request_pty(true, "xterm", 70_000, 24, 0, 0, &[])
        .await
        .expect("send pty request");

    let msg = timeout(TEST_TIMEOUT, channel.wait())
        .await
        .expect("reply must arrive");
    assert!(
        matches!(msg, Some(ChannelMsg::Failure)),
        "dimensions beyond u16 must be refused, not truncated"
    );
}

#[tokio::test]
async fn test_oversized_forward_port_is_refused() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    // Port 70000 would silently become 4464 if truncated to u16.
    let result = timeout(TEST_TIMEOUT, session.tcpip_forward("127.0.0.1", 70_000))
        .await
        .expect("reply must arrive");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_reverse_dial_reaches_listen_mode_controller() {
    // The controller side is this same agent in listen mode.
    let controller = AgentServer::new(Arc::new(AgentConfig::default())).expect("server setup");
    let listener = RemoteListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("bound address").port();
    tokio::spawn(async move {
        let _ = controller.serve(listener).await;
    });

    let config = AgentConfig {
        mode: Mode::Reverse(Target::parse("reverse@127.0.0.1").unwrap()),
        port,
        // Port 0: the controller picks, and the reply carries it.
        remote_bind_port: 0,
        ..Default::default()
    };
    let tunnel = timeout(TEST_TIMEOUT, tunnel::dial_home(&config))
        .await
        .expect("dial must complete")
        .expect("reverse bootstrap against own listen mode");
    tunnel.close().await;
}

#[tokio::test]
async fn test_shell_without_pty_holds_for_forwarding() {
    let mut session = connect(AgentConfig::default()).await;
    authenticate(&mut session).await;

    let mut channel = session.channel_open_session().await.expect("open channel");
    channel.request_shell(true).await.expect("shell request");

    // The session stays open; the banner is the only output.
    let banner = loop {
        let msg = timeout(TEST_TIMEOUT, channel.wait())
            .await
            .expect("banner must arrive");
        match msg {
            Some(ChannelMsg::Data { data }) => break data.to_vec(),
            Some(ChannelMsg::Success) => continue,
            other => panic!("unexpected message before banner: {:?}", other),
        }
    };
    assert!(String::from_utf8_lossy(&banner).contains("Remote forwarding available"));
}
