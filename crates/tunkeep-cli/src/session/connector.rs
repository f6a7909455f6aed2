//! Opening the two control channels.

use std::future::Future;
use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::debug;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of a command channel.
pub struct CommandChannel {
    pub reader: BoxedRead,
    pub writer: BoxedWrite,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel").finish_non_exhaustive()
    }
}

/// Opens the command and event channels to the daemon.
pub trait Connector: Send + Sync + 'static {
    fn connect_commands(&self) -> impl Future<Output = io::Result<CommandChannel>> + Send;

    /// The event channel is read-only from the client's side.
    fn connect_events(&self) -> impl Future<Output = io::Result<BoxedRead>> + Send;
}

/// Connects over the daemon's unix sockets.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    command_socket: PathBuf,
    event_socket: PathBuf,
}

impl UnixConnector {
    pub fn new(command_socket: impl Into<PathBuf>, event_socket: impl Into<PathBuf>) -> Self {
        Self {
            command_socket: command_socket.into(),
            event_socket: event_socket.into(),
        }
    }
}

impl Connector for UnixConnector {
    async fn connect_commands(&self) -> io::Result<CommandChannel> {
        debug!(path = %self.command_socket.display(), "Connecting command channel");
        let stream = UnixStream::connect(&self.command_socket).await?;
        let (reader, writer) = stream.into_split();
        Ok(CommandChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn connect_events(&self) -> io::Result<BoxedRead> {
        debug!(path = %self.event_socket.display(), "Connecting event channel");
        let stream = UnixStream::connect(&self.event_socket).await?;
        Ok(Box::new(stream))
    }
}
