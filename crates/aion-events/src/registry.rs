//! Event bus: fans published events out to stream subscribers.

use tokio::sync::broadcast;

use crate::events::AppEvent;

/// Publishes [`AppEvent`]s to every subscriber, in publish order.
pub struct EventBus {
    stream: broadcast::Sender<AppEvent>,
}

impl EventBus {
    /// Create a bus whose stream buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(capacity.max(1));
        Self { stream }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.stream.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.stream.receiver_count()
    }

    /// Publish an event to all subscribers.
    pub fn emit(&self, event: AppEvent) {
        tracing::debug!(event = event.name(), job_id = ?event.job_id(), "emit");
        // No subscribers is not an error.
        let _ = self.stream.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
