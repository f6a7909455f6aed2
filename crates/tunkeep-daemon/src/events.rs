//! Event fan-out to every connected event-channel client.
//!
//! Producers enqueue into one bounded queue; a pump task forwards each event
//! to a broadcast channel that every event-channel connection subscribes to.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use tunkeep_core::ipc::Event;
use tunkeep_core::policy::EVENT_QUEUE_CAPACITY;

/// Longest time `broadcast` waits for room in a full queue.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-subscriber buffer in the fan-out channel.
const SUBSCRIBER_CAPACITY: usize = 64;

/// Shared handle for publishing events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    queue: mpsc::Sender<Event>,
    fanout: broadcast::Sender<Event>,
}

impl EventBroadcaster {
    /// Create the broadcaster and spawn its pump task. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (queue, mut rx) = mpsc::channel::<Event>(capacity);
        let (fanout, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let out = fanout.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // No subscribers is not an error.
                let _ = out.send(event);
            }
            debug!("Event queue closed, pump exiting");
        });
        Self { queue, fanout }
    }

    /// Enqueue an event for all subscribers.
    ///
    /// A full queue is logged and waited on for at most one second, so a
    /// stalled pump cannot block producers indefinitely. Only then is the
    /// event dropped, with an error log naming it.
    pub async fn broadcast(&self, event: Event) {
        if self.queue.capacity() == 0 {
            warn!(
                op = event.op(),
                capacity = self.queue.max_capacity(),
                "Event queue is full; waiting for room"
            );
        }
        let op = event.op();
        match self.queue.send_timeout(event, ENQUEUE_TIMEOUT).await {
            Ok(()) => debug!(op, "Event queued"),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                error!(op, "Event queue still full; event dropped");
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                error!(op, "Event queue closed; event dropped");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.fanout.subscribe()
    }

    /// Number of free slots in the queue.
    pub fn available(&self) -> usize {
        self.queue.capacity()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn removed(fp: &str) -> Event {
        Event::IdentityRemoved {
            fingerprint: fp.into(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let events = EventBroadcaster::new();
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        events.broadcast(removed("1")).await;
        events.broadcast(removed("2")).await;

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap(), removed("1"));
            assert_eq!(rx.recv().await.unwrap(), removed("2"));
        }
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_fine() {
        let events = EventBroadcaster::new();
        events.broadcast(removed("x")).await;
        let mut late = events.subscribe();
        events.broadcast(removed("y")).await;
        // "x" may or may not still be in flight when subscribing.
        while late.recv().await.unwrap() != removed("y") {}
    }

    #[tokio::test]
    async fn full_queue_drops_after_bounded_wait() {
        let (queue, _rx) = mpsc::channel::<Event>(1);
        let (fanout, _) = broadcast::channel(4);
        let events = EventBroadcaster { queue, fanout };

        events.broadcast(removed("1")).await;
        assert_eq!(events.available(), 0);

        let started = std::time::Instant::now();
        events.broadcast(removed("2")).await;
        assert!(started.elapsed() >= ENQUEUE_TIMEOUT);
        assert_eq!(events.available(), 0);
    }
}
