//! Broadcast stream carrying [`TelemetryEvent`]s to the presentation layer.
//!
//! Many subscribers, publish-order delivery per subscriber. Publishing never
//! blocks: a subscriber that falls behind drops its oldest events and the
//! channel reports the lag on its next `recv`. Subscribers that join late
//! miss events published before they subscribed.

use crate::domain::models::TelemetryEvent;
use tokio::sync::broadcast;

/// Events buffered per subscriber before lag kicks in.
const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct TelemetryStream {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to every current subscriber. An event published
    /// while nobody is subscribed is simply dropped.
    pub fn publish(&self, event: TelemetryEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TelemetryStream {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
