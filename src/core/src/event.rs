use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Mirror event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorEvent {
    /// Event key (e.g., "mirror.unit.succeeded")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl MirrorEvent {
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    pub fn with_string(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(key, EventPayload::String(message.into()))
    }

    pub fn with_map(key: impl Into<String>, map: HashMap<String, serde_json::Value>) -> Self {
        Self::new(key, EventPayload::Map(map))
    }
}

/// Broadcasts mirror progress to any number of subscribers.
///
/// Emitting never blocks; events are dropped when nobody listens.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<MirrorEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn emit(&self, event: MirrorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.sender.subscribe()
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const UNIT_SUCCEEDED: &str = "mirror.unit.succeeded";
    pub const UNIT_FAILED: &str = "mirror.unit.failed";
    pub const UNIT_SKIPPED: &str = "mirror.unit.skipped";
    pub const BATCH_CANCELLED: &str = "mirror.batch.cancelled";
    pub const BATCH_COMPLETED: &str = "mirror.batch.completed";
    pub const ARCHIVE_SEGMENT_CLOSED: &str = "mirror.archive.segment.closed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(MirrorEvent::with_string(events::UNIT_SUCCEEDED, "quay.io/a:1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::UNIT_SUCCEEDED);
        assert!(matches!(event.payload, EventPayload::String(ref s) if s == "quay.io/a:1"));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let emitter = EventEmitter::new(1);
        emitter.emit(MirrorEvent::empty(events::BATCH_COMPLETED));
    }
}
