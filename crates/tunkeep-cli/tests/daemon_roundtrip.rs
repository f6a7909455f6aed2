#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Client session against a real control server over unix sockets.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tunkeep_cli::session::{ConnectionState, ControlSession, SessionConfig, UnixConnector};
use tunkeep_core::ipc::{Event, Request};
use tunkeep_core::{AgentPaths, RuntimeConfig};
use tunkeep_daemon::context::RuntimeContext;
use tunkeep_daemon::controller::{ControllerOptions, TunnelController};
use tunkeep_daemon::events::EventBroadcaster;
use tunkeep_daemon::net::InterfaceProvisioner;
use tunkeep_daemon::server::ControlServer;
use tunkeep_daemon::store::ConfigStore;
use tunkeep_daemon::testing::{FakeTransport, RecordingBackend};

fn controller(config_dir: &Path) -> TunnelController<FakeTransport> {
    let ctx = Arc::new(RuntimeContext::new(
        ConfigStore::new(config_dir),
        RuntimeConfig::default(),
        EventBroadcaster::new(),
    ));
    let tun = Arc::new(InterfaceProvisioner::new(
        Arc::new(RecordingBackend::default()),
        "tk-test",
    ));
    TunnelController::new(
        ctx,
        tun,
        Arc::new(FakeTransport::default()),
        ControllerOptions {
            metrics_interval: Duration::ZERO,
            ..Default::default()
        },
    )
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..500 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(path.exists(), "socket {} never appeared", path.display());
}

#[tokio::test]
async fn status_events_and_clean_shutdown() {
    let dir = tempfile::TempDir::new().unwrap();
    let paths = AgentPaths::new(dir.path().join("config"), dir.path().join("run"));

    let ctl = controller(&paths.config_dir);
    let server = ControlServer::new(ctl.clone(), paths.command_socket(), paths.event_socket());
    let server_task = tokio::spawn(server.serve(ctl.shutdown_signal()));
    wait_for_socket(&paths.event_socket()).await;

    let session = ControlSession::new(
        UnixConnector::new(paths.command_socket(), paths.event_socket()),
        SessionConfig {
            reconnect_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
        },
    );
    let mut events = session.subscribe();
    session.connect().await.unwrap();
    assert!(session.is_connected());

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.op(), "tunnel-status");

    let status = session.send(&Request::Status).await.unwrap();
    assert!(status.is_success());
    let cfg: RuntimeConfig = status.payload_as().unwrap();
    assert!(cfg.identities.is_empty());

    let rejected = session
        .send(&Request::SetNotificationFrequency { minutes: 1 })
        .await
        .unwrap();
    assert!(!rejected.is_success());
    assert!(session.is_connected());

    let accepted = session
        .send(&Request::SetNotificationFrequency { minutes: 30 })
        .await
        .unwrap();
    assert!(accepted.is_success());
    assert_eq!(
        ConfigStore::new(&paths.config_dir)
            .load()
            .unwrap()
            .notification_frequency,
        30
    );

    ctl.shutdown("test over").await;
    let mut state = session.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(session.clean_shutdown());
    assert!(!session.is_reconnecting());

    let mut saw_shutdown = false;
    while let Ok(event) = events.try_recv() {
        saw_shutdown |= matches!(event, Event::Shutdown { .. });
    }
    assert!(saw_shutdown);

    server_task.await.unwrap().unwrap();
    assert!(!paths.command_socket().exists());
}
