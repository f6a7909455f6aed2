//! Control session state machine.
//!
//! `Disconnected -> Connecting -> Connected`, and on an unexpected loss
//! `Connected -> Reconnecting -> Connecting`. A `shutdown` event from the
//! daemon marks the following disconnect as clean, in which case the session
//! settles in `Disconnected` instead of reconnecting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::io::BufReader;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tunkeep_core::ipc::{Event, Request, Response, read_message, write_message};
use tunkeep_core::policy::EMPTY_LINE_THRESHOLD;

use super::connector::{BoxedRead, BoxedWrite, Connector};
use super::throttle::ReconnectLogThrottle;
use super::{ConnectionState, SessionConfig, SessionError};

/// Capacity of the client-side event fan-out.
const EVENT_BUFFER: usize = 64;

struct CommandStream {
    reader: BufReader<BoxedRead>,
    writer: BoxedWrite,
}

impl CommandStream {
    /// Write a request, retrying once if the first write fails.
    async fn send(&mut self, request: &Request) -> Result<(), SessionError> {
        if let Err(first) = write_message(&mut self.writer, request).await {
            warn!(command = request.name(), error = %first, "Send failed; retrying once");
            write_message(&mut self.writer, request)
                .await
                .map_err(SessionError::Send)?;
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Response, SessionError> {
        match read_message::<_, Response>(&mut self.reader).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(SessionError::Closed),
            Err(e) => Err(SessionError::Receive(e)),
        }
    }
}

/// A client's connection to the daemon.
pub struct ControlSession<C: Connector> {
    connector: C,
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
    clean_shutdown: AtomicBool,
    closed: AtomicBool,
    /// Bumped on every connect and every handled disconnect, so a stale event
    /// loop cannot tear down a newer connection.
    generation: AtomicU64,
    command: Mutex<Option<CommandStream>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<Event>,
}

impl<C: Connector> std::fmt::Debug for ControlSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("state", &*self.state.borrow())
            .field("reconnecting", &self.is_reconnecting())
            .field("clean_shutdown", &self.clean_shutdown())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ControlSession<C> {
    pub fn new(connector: C, config: SessionConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            connector,
            config,
            state,
            reconnecting: AtomicBool::new(false),
            clean_shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            command: Mutex::new(None),
            event_task: Mutex::new(None),
            events,
        })
    }

    pub const fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Whether the daemon announced its shutdown before the last disconnect.
    pub fn clean_shutdown(&self) -> bool {
        self.clean_shutdown.load(Ordering::SeqCst)
    }

    /// Events pushed by the daemon. Subscribe before connecting to see the
    /// initial status snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Open both channels and start the event read loop.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        self.closed.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        match self.open_channels().await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Returns the generation of the new connection.
    async fn open_channels(self: &Arc<Self>) -> Result<u64, SessionError> {
        let command = self
            .connector
            .connect_commands()
            .await
            .map_err(SessionError::Connect)?;
        let events = self
            .connector
            .connect_events()
            .await
            .map_err(SessionError::Connect)?;

        let mut slot = self.command.lock().await;
        *slot = Some(CommandStream {
            reader: BufReader::new(command.reader),
            writer: command.writer,
        });
        self.clean_shutdown.store(false, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(slot);

        let session = Arc::clone(self);
        let task = tokio::spawn(async move { session.read_events(events, generation).await });
        if let Some(old) = self.event_task.lock().await.replace(task) {
            old.abort();
        }

        self.set_state(ConnectionState::Connected);
        info!("Connected to service");
        Ok(generation)
    }

    /// Send one request and wait for its response.
    ///
    /// A transport failure is treated as a lost connection and starts the
    /// reconnect loop before the error is returned.
    pub async fn send(self: &Arc<Self>, request: &Request) -> Result<Response, SessionError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let result = {
            let mut guard = self.command.lock().await;
            let Some(stream) = guard.as_mut() else {
                return Err(SessionError::NotConnected);
            };
            debug!(command = request.name(), "Sending request");
            match stream.send(request).await {
                Ok(()) => stream.receive().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = &result {
            let lost = match e {
                SessionError::Send(inner) | SessionError::Receive(inner) => inner.is_transport(),
                SessionError::Closed => true,
                SessionError::NotConnected | SessionError::Connect(_) => false,
            };
            if lost {
                warn!(error = %e, "Command channel failed");
                self.client_disconnected(generation).await;
            }
        }
        result
    }

    async fn read_events(self: Arc<Self>, reader: BoxedRead, generation: u64) {
        let mut reader = BufReader::new(reader);
        let mut malformed = 0;
        loop {
            match read_message::<_, Event>(&mut reader).await {
                Ok(Some(event)) => {
                    malformed = 0;
                    trace!(op = event.op(), "Event received");
                    if let Event::Shutdown { reason } = &event {
                        info!(%reason, "Service is shutting down");
                        self.clean_shutdown.store(true, Ordering::SeqCst);
                    }
                    // No subscribers is fine.
                    let _ = self.events.send(event);
                }
                Ok(None) => {
                    debug!("Event stream ended");
                    break;
                }
                Err(e) if e.is_transport() => {
                    warn!(error = %e, "Event stream failed");
                    break;
                }
                Err(e) => {
                    malformed += 1;
                    warn!(error = %e, malformed, "Skipping malformed event");
                    if malformed >= EMPTY_LINE_THRESHOLD {
                        warn!("Too many malformed events in a row");
                        break;
                    }
                }
            }
        }
        self.client_disconnected(generation).await;
    }

    /// Handle the loss of the connection identified by `generation`.
    async fn client_disconnected(self: &Arc<Self>, generation: u64) {
        // Held across the check so a concurrent connect cannot slip between.
        let mut slot = self.command.lock().await;
        if self
            .generation
            .compare_exchange(
                generation,
                generation + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!(generation, "Ignoring disconnect of a stale connection");
            return;
        }
        slot.take();
        drop(slot);

        if self.closed.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        if self.clean_shutdown() {
            info!("Service stopped; not reconnecting");
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        warn!("Connection to service lost");
        self.reconnect();
    }

    /// Start the background reconnect loop unless one is already running.
    /// Returns `true` if this call started it.
    pub fn reconnect(self: &Arc<Self>) -> bool {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in progress");
            return false;
        }
        self.set_state(ConnectionState::Reconnecting);
        let session = Arc::clone(self);
        tokio::spawn(async move { session.reconnect_loop().await });
        true
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut throttle = ReconnectLogThrottle::new(Instant::now());
        loop {
            tokio::time::sleep(self.config.reconnect_delay).await;
            if self.closed.load(Ordering::SeqCst) {
                debug!("Session closed; abandoning reconnect");
                self.set_state(ConnectionState::Disconnected);
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }

            self.set_state(ConnectionState::Connecting);
            match self.open_channels().await {
                Ok(generation) => {
                    info!(failures = throttle.failures(), "Reconnected to service");
                    self.reconnecting.store(false, Ordering::SeqCst);
                    // A disconnect handled before the flag was cleared could
                    // not start its own loop.
                    if !self.lost_since(generation)
                        || self
                            .reconnecting
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_err()
                    {
                        return;
                    }
                    warn!("Connection lost again while reconnecting");
                    self.set_state(ConnectionState::Reconnecting);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Reconnecting);
                    let now = Instant::now();
                    if throttle.should_log(now) {
                        warn!(
                            error = %e,
                            failures = throttle.failures(),
                            elapsed_secs = throttle.elapsed(now).as_secs(),
                            "Reconnect failed; will keep trying"
                        );
                    } else {
                        trace!(error = %e, "Reconnect failed");
                    }
                }
            }
        }
    }

    /// Whether the connection opened as `generation` has since been lost and
    /// should be re-established.
    fn lost_since(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
            && !self.closed.load(Ordering::SeqCst)
            && !self.clean_shutdown()
    }

    /// Poll until the session is connected and no reconnect is in flight.
    pub async fn wait_for_connection(&self) {
        while !(self.is_connected() && !self.is_reconnecting()) {
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Drop both channels and stop reconnecting.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.command.lock().await.take();
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        if !self.is_reconnecting() {
            self.set_state(ConnectionState::Disconnected);
        }
        debug!("Session closed");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?*current, to = ?state, "Connection state changed");
                *current = state;
                true
            }
        });
    }
}
