//! Observability event fan-out.

use serde_json::Value;
use switchboard_types::{EventKind, ObservabilityEvent};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`ObservabilityEvent`]s to any number of subscribers.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// only logged.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<ObservabilityEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>, payload: Value) {
        self.publish(ObservabilityEvent::new(kind, message, payload));
    }

    pub fn publish(&self, event: ObservabilityEvent) {
        tracing::debug!(kind = event.kind.as_str(), "{}", event.display_message);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.tx.subscribe()
    }
}
