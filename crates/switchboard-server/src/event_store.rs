//! Resumability: stores outgoing SSE events so a reconnecting client can ask
//! for everything after its `Last-Event-ID`.

use std::sync::Mutex;

use switchboard_transport::BoxFuture;
use switchboard_types::JsonRpcMessage;

use crate::error::ServerError;

/// Events recorded after a given event id on the same stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub stream_id: String,
    /// `(event_id, message)` in send order.
    pub events: Vec<(String, JsonRpcMessage)>,
}

pub trait EventStore: Send + Sync {
    /// Persist `message` for `stream_id`, returning its event id.
    fn store_event<'a>(
        &'a self,
        stream_id: &'a str,
        message: &'a JsonRpcMessage,
    ) -> BoxFuture<'a, Result<String, ServerError>>;

    /// Everything stored after `last_event_id` on that event's stream.
    /// `None` when the id is unknown.
    fn replay_events_after<'a>(
        &'a self,
        last_event_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Replay>, ServerError>>;
}

struct StoredEvent {
    id: String,
    stream_id: String,
    message: JsonRpcMessage,
}

/// Unbounded in-memory [`EventStore`]. Event ids are `{stream_id}_{seq}`.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: Mutex<Events>,
}

#[derive(Default)]
struct Events {
    next_seq: u64,
    log: Vec<StoredEvent>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Events>, ServerError> {
        self.inner
            .lock()
            .map_err(|_| ServerError::Storage("event store lock poisoned".into()))
    }
}

impl EventStore for InMemoryEventStore {
    fn store_event<'a>(
        &'a self,
        stream_id: &'a str,
        message: &'a JsonRpcMessage,
    ) -> BoxFuture<'a, Result<String, ServerError>> {
        Box::pin(async move {
            let mut events = self.lock()?;
            events.next_seq += 1;
            let id = format!("{stream_id}_{}", events.next_seq);
            events.log.push(StoredEvent {
                id: id.clone(),
                stream_id: stream_id.to_string(),
                message: message.clone(),
            });
            Ok(id)
        })
    }

    fn replay_events_after<'a>(
        &'a self,
        last_event_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Replay>, ServerError>> {
        Box::pin(async move {
            let events = self.lock()?;
            let Some(pos) = events.log.iter().position(|e| e.id == last_event_id) else {
                return Ok(None);
            };
            let stream_id = events.log[pos].stream_id.clone();
            let replayed = events.log[pos + 1..]
                .iter()
                .filter(|e| e.stream_id == stream_id)
                .map(|e| (e.id.clone(), e.message.clone()))
                .collect();
            Ok(Some(Replay {
                stream_id,
                events: replayed,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(n: i64) -> JsonRpcMessage {
        JsonRpcMessage::notification("notifications/progress", Some(serde_json::json!({"n": n})))
    }

    #[tokio::test]
    async fn ids_carry_stream_prefix() {
        let store = InMemoryEventStore::new();
        let id = store.store_event("s1", &note(1)).await.unwrap();
        assert!(id.starts_with("s1_"));
    }

    #[tokio::test]
    async fn replay_returns_later_events_of_same_stream() {
        let store = InMemoryEventStore::new();
        let first = store.store_event("a", &note(1)).await.unwrap();
        store.store_event("b", &note(2)).await.unwrap();
        let third = store.store_event("a", &note(3)).await.unwrap();

        let replay = store.replay_events_after(&first).await.unwrap().unwrap();
        assert_eq!(replay.stream_id, "a");
        assert_eq!(replay.events, vec![(third, note(3))]);
    }

    #[tokio::test]
    async fn replay_of_last_event_is_empty() {
        let store = InMemoryEventStore::new();
        let only = store.store_event("a", &note(1)).await.unwrap();
        let replay = store.replay_events_after(&only).await.unwrap().unwrap();
        assert!(replay.events.is_empty());
    }

    #[tokio::test]
    async fn unknown_event_id() {
        let store = InMemoryEventStore::new();
        assert!(store.replay_events_after("nope_1").await.unwrap().is_none());
    }
}
