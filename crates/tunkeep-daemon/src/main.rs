//! tunkeep daemon
//!
//! Owns the virtual interface and identity sessions, and serves the command
//! and event control channels to local clients.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use tunkeep_core::AgentPaths;
use tunkeep_core::policy::DEFAULT_INTERFACE_NAME;
use tunkeep_core::tracing_init::init_tracing;
use tunkeep_daemon::context::RuntimeContext;
use tunkeep_daemon::controller::{ControllerOptions, TunnelController};
use tunkeep_daemon::events::EventBroadcaster;
use tunkeep_daemon::net::{InterfaceProvisioner, LinuxBackend};
use tunkeep_daemon::server::ControlServer;
use tunkeep_daemon::store::{ConfigStore, scan_for_orphans};
use tunkeep_daemon::transport::HttpControllerTransport;

#[derive(Parser, Debug)]
#[command(name = "tunkeep-daemon")]
#[command(version, about = "tunkeep daemon - tunnel runtime controller")]
struct Args {
    /// Directory holding config.json and identity files
    #[arg(long, env = "TUNKEEP_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory for the control-channel sockets
    #[arg(long, env = "TUNKEEP_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Name of the virtual interface
    #[arg(long, default_value = DEFAULT_INTERFACE_NAME, env = "TUNKEEP_INTERFACE")]
    interface: String,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    /// A level saved with `set_log_level` takes precedence.
    #[arg(long, default_value = "info", env = "TUNKEEP_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TUNKEEP_LOG_JSON")]
    log_json: bool,

    /// Seconds between identity refreshes.
    #[arg(long, default_value_t = 10, env = "TUNKEEP_REFRESH_INTERVAL")]
    refresh_interval: u64,

    /// Seconds between metrics events (0 disables them).
    #[arg(long, default_value_t = 5, env = "TUNKEEP_METRICS_INTERVAL")]
    metrics_interval: u64,

    /// Timeout in seconds for controller HTTP requests.
    #[arg(long, default_value_t = 15, env = "TUNKEEP_HTTP_TIMEOUT")]
    http_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_handle = init_tracing("tunkeep_daemon", &args.log_level, args.log_json);

    let paths = AgentPaths::resolve(args.config_dir, args.runtime_dir)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %paths.config_dir.display(),
        runtime_dir = %paths.runtime_dir.display(),
        interface = %args.interface,
        "Starting tunkeep-daemon"
    );

    let store = ConfigStore::new(&paths.config_dir);
    let mut config = match store.load_or_purge() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Cannot load runtime state; exiting");
            return Err(e.into());
        }
    };

    if !config.log_level.is_empty()
        && let Err(e) = log_handle.set_level(&config.log_level)
    {
        warn!(level = %config.log_level, error = %e, "Ignoring saved log level");
    }

    let recovered = scan_for_orphans(&mut config, &paths.config_dir);
    let normalized = config.normalize();

    let ctx = Arc::new(RuntimeContext::new(store, config, EventBroadcaster::new()));
    if !recovered.is_empty() || normalized {
        ctx.persist().await?;
    }

    let tun = Arc::new(InterfaceProvisioner::new(
        Arc::new(LinuxBackend::new()),
        args.interface,
    ));
    let transport = Arc::new(HttpControllerTransport::new(Duration::from_secs(
        args.http_timeout,
    ))?);
    let options = ControllerOptions {
        refresh_interval: Duration::from_secs(args.refresh_interval),
        metrics_interval: Duration::from_secs(args.metrics_interval),
    };
    let controller =
        TunnelController::new(ctx, tun, transport, options).with_log_level_handle(log_handle);

    let server = ControlServer::new(
        controller.clone(),
        paths.command_socket(),
        paths.event_socket(),
    );
    let server_handle = tokio::spawn(server.serve(controller.shutdown_signal()));

    if let Err(e) = controller.start().await {
        error!(error = %e, "Failed to start tunnel");
        controller.shutdown("startup failed").await;
        let _ = server_handle.await;
        return Err(e.into());
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    {
        if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
            warn!(error = %e, "Failed to notify systemd");
        }
    }

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    controller.shutdown("service stopping").await;
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Control server failed"),
        Err(e) => error!(error = %e, "Control server task panicked"),
    }

    info!("Daemon stopped");
    Ok(())
}
