//! Control-channel server.
//!
//! Two unix sockets: the command socket answers one JSON request per line,
//! the event socket pushes a status snapshot followed by every broadcast
//! event.

mod handler;

pub use handler::handle_request;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use tunkeep_core::ipc::{Event, Request, Response, read_message, write_message};

use crate::controller::TunnelController;
use crate::transport::TunnelTransport;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves the command and event sockets for one controller.
pub struct ControlServer<T: TunnelTransport> {
    controller: TunnelController<T>,
    command_socket: PathBuf,
    event_socket: PathBuf,
}

impl<T: TunnelTransport> ControlServer<T> {
    pub const fn new(
        controller: TunnelController<T>,
        command_socket: PathBuf,
        event_socket: PathBuf,
    ) -> Self {
        Self {
            controller,
            command_socket,
            event_socket,
        }
    }

    /// Accept connections until `shutdown` flips to `true`. Socket files are
    /// removed on return.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let commands = bind_socket(&self.command_socket)?;
        let events = bind_socket(&self.event_socket)?;
        info!(
            command = %self.command_socket.display(),
            events = %self.event_socket.display(),
            "Control channels listening"
        );

        loop {
            tokio::select! {
                accepted = commands.accept() => match accepted {
                    Ok((stream, _)) => {
                        let controller = self.controller.clone();
                        tokio::spawn(async move {
                            let (rd, wr) = stream.into_split();
                            serve_commands(&controller, rd, wr).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Command socket accept failed"),
                },
                accepted = events.accept() => match accepted {
                    Ok((stream, _)) => {
                        let controller = self.controller.clone();
                        tokio::spawn(async move {
                            let (_rd, wr) = stream.into_split();
                            serve_events(&controller, wr).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Event socket accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for path in [&self.command_socket, &self.event_socket] {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Could not remove socket file");
            }
        }
        info!("Control channels closed");
        Ok(())
    }
}

fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

/// Answer requests from one command connection until it closes.
pub async fn serve_commands<T, R, W>(controller: &TunnelController<T>, reader: R, mut writer: W)
where
    T: TunnelTransport,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let response = match read_message::<_, Request>(&mut reader).await {
            Ok(Some(request)) => handle_request(controller, request).await,
            Ok(None) => break,
            Err(e) if e.is_transport() => {
                debug!(error = %e, "Command connection dropped");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Malformed request");
                Response::failure("malformed request", e)
            }
        };
        if let Err(e) = write_message(&mut writer, &response).await {
            debug!(error = %e, "Could not write response");
            break;
        }
    }
    debug!("Command connection closed");
}

/// Push a status snapshot, then every broadcast event, to one client. The
/// connection is closed after a `shutdown` event.
pub async fn serve_events<T, W>(controller: &TunnelController<T>, mut writer: W)
where
    T: TunnelTransport,
    W: AsyncWrite + Unpin,
{
    let mut rx = controller.context().events().subscribe();
    let status = controller.status(false).await;
    if let Err(e) = write_message(&mut writer, &Event::TunnelStatus { status }).await {
        debug!(error = %e, "Event client left before initial status");
        return;
    }

    loop {
        match rx.recv().await {
            Ok(event) => {
                let last = matches!(event, Event::Shutdown { .. });
                if let Err(e) = write_message(&mut writer, &event).await {
                    debug!(error = %e, "Event client disconnected");
                    break;
                }
                if last {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event client lagged, events lost");
            }
            Err(broadcast::error::RecvError::Closed) => {
                error!("Event broadcaster closed");
                break;
            }
        }
    }
    debug!("Event connection closed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use crate::context::RuntimeContext;
    use crate::controller::ControllerOptions;
    use crate::events::EventBroadcaster;
    use crate::net::InterfaceProvisioner;
    use crate::store::ConfigStore;
    use crate::testing::{FakeTransport, RecordingBackend};
    use tunkeep_core::RuntimeConfig;

    fn controller(dir: &Path) -> TunnelController<FakeTransport> {
        let ctx = Arc::new(RuntimeContext::new(
            ConfigStore::new(dir),
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

    #[tokio::test]
    async fn command_connection_answers_each_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctl = controller(dir.path());
        let (client, server) = tokio::io::duplex(4096);
        let (srv_rd, srv_wr) = tokio::io::split(server);
        let task = tokio::spawn(async move { serve_commands(&ctl, srv_rd, srv_wr).await });

        let (cli_rd, mut cli_wr) = tokio::io::split(client);
        let mut cli_rd = BufReader::new(cli_rd);
        cli_wr
            .write_all(b"{\"command\":\"set_notification_frequency\",\"data\":{\"minutes\":2}}\n\nnot json\n")
            .await
            .unwrap();
        write_message(&mut cli_wr, &Request::Status).await.unwrap();

        let bad_range: Response = read_message(&mut cli_rd).await.unwrap().unwrap();
        assert!(!bad_range.is_success());
        let malformed: Response = read_message(&mut cli_rd).await.unwrap().unwrap();
        assert_eq!(malformed.message, "malformed request");
        let status: Response = read_message(&mut cli_rd).await.unwrap().unwrap();
        let cfg: RuntimeConfig = status.payload_as().unwrap();
        assert_eq!(cfg.service_version, crate::context::SERVICE_VERSION);

        drop(cli_wr);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn event_connection_starts_with_status_and_ends_on_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctl = controller(dir.path());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server_ctl = ctl.clone();
        let task = tokio::spawn(async move { serve_events(&server_ctl, server).await });

        let mut rd = BufReader::new(client);
        let first: Event = read_message(&mut rd).await.unwrap().unwrap();
        assert_eq!(first.op(), "tunnel-status");

        ctl.shutdown("test over").await;
        let mut saw_shutdown = false;
        while let Some(event) = read_message::<_, Event>(&mut rd).await.unwrap() {
            saw_shutdown |= matches!(event, Event::Shutdown { .. });
        }
        assert!(saw_shutdown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sockets_are_served_and_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctl = controller(dir.path());
        let cmd = dir.path().join("run").join("command.sock");
        let evt = dir.path().join("run").join("events.sock");
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = ControlServer::new(ctl, cmd.clone(), evt.clone());
        let task = tokio::spawn(server.serve(stop_rx));

        let mut stream = loop {
            if let Ok(s) = tokio::net::UnixStream::connect(&cmd).await {
                break s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let (rd, mut wr) = stream.split();
        let mut rd = BufReader::new(rd);
        write_message(&mut wr, &Request::Metrics).await.unwrap();
        let resp: Response = read_message(&mut rd).await.unwrap().unwrap();
        assert!(resp.is_success());

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(!cmd.exists());
        assert!(!evt.exists());
    }
}
