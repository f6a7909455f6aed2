//! Client side of the control channels.
//!
//! A [`ControlSession`] holds one command channel (request/response) and
//! one event channel (server push) to the daemon, and keeps reconnecting
//! when the daemon goes away unexpectedly.

mod connector;
mod control;
mod throttle;

pub use connector::{BoxedRead, BoxedWrite, CommandChannel, Connector, UnixConnector};
pub use control::ControlSession;
pub use throttle::ReconnectLogThrottle;

use std::time::Duration;

use tunkeep_core::policy::{CONNECTION_POLL_INTERVAL, RECONNECT_DELAY};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Session timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Poll interval of [`ControlSession::wait_for_connection`].
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            poll_interval: CONNECTION_POLL_INTERVAL,
        }
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not connected to the service")]
    NotConnected,

    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("failed to send request: {0}")]
    Send(#[source] tunkeep_core::Error),

    #[error("failed to read response: {0}")]
    Receive(#[source] tunkeep_core::Error),

    #[error("connection closed before a response arrived")]
    Closed,
}
