//! tunkeep CLI
//!
//! Sends control requests to the tunkeep daemon and streams its events.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;

use tunkeep_cli::commands::{self, Command};
use tunkeep_cli::session::{ControlSession, SessionConfig, UnixConnector};
use tunkeep_core::AgentPaths;
use tunkeep_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "tunkeep")]
#[command(version, about = "Control client for the tunkeep daemon", long_about = None)]
struct Cli {
    /// Directory holding the daemon's control sockets
    #[arg(long, env = "TUNKEEP_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Log level for client diagnostics (written to stderr)
    #[arg(long, default_value = "warn", env = "TUNKEEP_LOG_LEVEL")]
    log_level: String,

    /// Seconds to wait for the daemon before giving up
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Stream daemon events as JSON lines, reconnecting until it shuts down
    Watch,
    #[command(flatten)]
    Request(Command),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("tunkeep_cli", &cli.log_level, false);

    let paths = AgentPaths::resolve(None, cli.runtime_dir)?;
    let connector = UnixConnector::new(paths.command_socket(), paths.event_socket());
    let session = ControlSession::new(connector, SessionConfig::default());

    match cli.action {
        Action::Watch => {
            if let Err(e) = session.connect().await {
                debug!(error = %e, "Service not reachable yet; waiting");
                session.reconnect();
            }
            commands::watch(&session).await?;
        }
        Action::Request(command) => {
            tokio::time::timeout(Duration::from_secs(cli.connect_timeout), session.connect())
                .await
                .context("timed out connecting to the tunkeep daemon")?
                .with_context(|| {
                    format!(
                        "cannot reach the tunkeep daemon at {}",
                        paths.runtime_dir.display()
                    )
                })?;
            commands::run(&session, command).await?;
        }
    }

    session.close().await;
    Ok(())
}
