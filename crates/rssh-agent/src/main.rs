//! rssh agent binary
//!
//! Runs in one of two modes: bind a local SSH listener and wait, or
//! dial out to a controller and serve sessions back through the
//! reverse tunnel. Both modes feed the same server loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rssh_agent::{tunnel, AgentServer, RemoteListener};
use rssh_core::config::default_shell;
use rssh_core::{AgentConfig, Mode, Target};

#[derive(Parser)]
#[command(name = "rssh")]
#[command(about = "Reverse SSH remote-access agent")]
#[command(version)]
struct Args {
    /// Bind a local listener instead of dialling out
    #[arg(short, long)]
    listen: bool,

    /// Port to listen on (listen mode) or connect to (reverse mode)
    #[arg(short, long, default_value_t = 31337)]
    port: u16,

    /// Port the controller should listen on after a reverse dial
    #[arg(short = 'b', long = "bind-port", default_value_t = 8888)]
    bind_port: u16,

    /// Shell for interactive sessions
    #[arg(short, long)]
    shell: Option<String>,

    /// Deny shell, command execution and local-forward requests
    #[arg(short = 'N', long = "no-shell")]
    no_shell: bool,

    /// Emit log output; also enables the interactive password prompt
    #[arg(short, long)]
    verbose: bool,

    /// Controller to dial, as [user@]host
    target: Option<String>,
}

fn build_config(args: &Args) -> Result<AgentConfig> {
    let mode = match (&args.target, args.listen) {
        (Some(target), false) => Mode::Reverse(Target::parse(target)?),
        _ => Mode::Listen,
    };
    Ok(AgentConfig {
        mode,
        bind_addr: format!("0.0.0.0:{}", args.port),
        port: args.port,
        remote_bind_port: args.bind_port,
        shell: args
            .shell
            .clone()
            .unwrap_or_else(|| default_shell().to_string()),
        deny_exec: args.no_shell,
        verbose: args.verbose,
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // A quiet agent logs nothing at all unless RUST_LOG says otherwise.
    let log_level = if args.verbose { "debug" } else { "off" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(build_config(&args).context("Invalid configuration")?);

    let listener = match &config.mode {
        Mode::Listen => {
            let listener = RemoteListener::bind(&config.bind_addr).await?;
            if let Some(addr) = listener.local_addr() {
                tracing::info!("Listening on {}", addr);
            }
            listener
        }
        Mode::Reverse(target) => {
            tracing::info!("Dialling home via {}@{}", target.user, target.host);
            tunnel::dial_home(&config).await?
        }
    };

    let server = AgentServer::new(Arc::clone(&config))?;
    server.serve(listener).await
}
