//! Event persistence for resumable streams.
//!
//! When an [`EventStore`] is configured, every frame written to an SSE
//! stream is persisted as `(event_id, stream_id, message)` and carries
//! its id in the `id:` field of the frame. A client that reconnects
//! with a `last-event-id` header gets the missed frames replayed in
//! their original order before the stream goes live again.
//!
//! Event ids embed the stream id (`"<streamId>_<uuid>"`) so the stream
//! a client is resuming can be recovered from the id alone.
//!
//! # Implementations
//!
//! * [`InMemoryEventStore`] — bounded in-memory buffer (default choice
//!   for single-process servers).
//!
//! Implement the [`EventStore`] trait to back resumability with a
//! database or any other external store. Implementations must tolerate
//! concurrent `store_event` and `replay_events_after` calls.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::{
    error::EventStoreError,
    model::{ServerJsonRpcMessage, ServerSseMessage},
};

pub type EventId = String;
pub type StreamId = String;

/// Recover the stream id embedded in an event id.
pub fn stream_id_of(event_id: &str) -> Option<&str> {
    event_id.rfind('_').map(|idx| &event_id[..idx])
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist one outbound message and return its freshly assigned
    /// event id. The store is the source of truth for ids; the SSE
    /// writer never invents them.
    async fn store_event(
        &self,
        stream_id: &str,
        message: &ServerJsonRpcMessage,
    ) -> Result<EventId, EventStoreError>;

    /// Replay every stored event on `last_event_id`'s stream that was
    /// written after it, in original order, delivering each through
    /// `tx`. Returns the stream id so the caller can adopt it.
    async fn replay_events_after(
        &self,
        last_event_id: &str,
        tx: &mpsc::Sender<ServerSseMessage>,
    ) -> Result<StreamId, EventStoreError>;
}

#[derive(Debug, Clone)]
struct StoredEvent {
    event_id: EventId,
    stream_id: StreamId,
    message: Arc<ServerJsonRpcMessage>,
}

/// In-memory event store with a bounded buffer.
///
/// Oldest events are evicted first; a client resuming from an evicted
/// event id gets [`EventStoreError::UnknownEventId`] and has to fall
/// back to a fresh stream.
pub struct InMemoryEventStore {
    events: Mutex<VecDeque<StoredEvent>>,
    max_events: usize,
}

impl InMemoryEventStore {
    pub const DEFAULT_MAX_EVENTS: usize = 1000;

    pub fn new() -> Self {
        Self::with_max_events(Self::DEFAULT_MAX_EVENTS)
    }

    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events,
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &str,
        message: &ServerJsonRpcMessage,
    ) -> Result<EventId, EventStoreError> {
        let event_id = format!("{stream_id}_{}", uuid::Uuid::new_v4());
        let mut events = self.events.lock().await;
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(StoredEvent {
            event_id: event_id.clone(),
            stream_id: stream_id.to_string(),
            message: Arc::new(message.clone()),
        });
        Ok(event_id)
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
        tx: &mpsc::Sender<ServerSseMessage>,
    ) -> Result<StreamId, EventStoreError> {
        // Collect under the lock, send outside it: the receiver may be
        // subject to back-pressure and the lock must not wait on it.
        let (stream_id, to_replay) = {
            let events = self.events.lock().await;
            let position = events
                .iter()
                .position(|event| event.event_id == last_event_id)
                .ok_or_else(|| EventStoreError::UnknownEventId(last_event_id.to_string()))?;
            let stream_id = events[position].stream_id.clone();
            let to_replay: Vec<StoredEvent> = events
                .iter()
                .skip(position + 1)
                .filter(|event| event.stream_id == stream_id)
                .cloned()
                .collect();
            (stream_id, to_replay)
        };

        for event in to_replay {
            tx.send(ServerSseMessage {
                event_id: Some(event.event_id),
                message: event.message,
            })
            .await
            .map_err(|_| EventStoreError::ReplayInterrupted)?;
        }
        Ok(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{JsonRpcMessage, JsonRpcNotification, JsonRpcVersion2_0};

    use super::*;

    fn notification(method: &str) -> ServerJsonRpcMessage {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.to_string(),
            params: None,
        })
    }

    #[test]
    fn test_stream_id_of() {
        assert_eq!(stream_id_of("abc_123"), Some("abc"));
        assert_eq!(
            stream_id_of("_GET_stream_0e3c9f34-aaaa-bbbb-cccc-000000000000"),
            Some("_GET_stream")
        );
        assert_eq!(stream_id_of("no-separator"), None);
    }

    #[tokio::test]
    async fn test_replay_returns_later_events_in_order() {
        let store = InMemoryEventStore::new();
        let e1 = store.store_event("s1", &notification("n1")).await.unwrap();
        let _other = store.store_event("s2", &notification("x1")).await.unwrap();
        let e2 = store.store_event("s1", &notification("n2")).await.unwrap();
        let e3 = store.store_event("s1", &notification("n3")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let stream_id = store.replay_events_after(&e1, &tx).await.unwrap();
        drop(tx);
        assert_eq!(stream_id, "s1");

        let mut replayed = Vec::new();
        while let Some(event) = rx.recv().await {
            replayed.push(event);
        }
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].event_id.as_deref(), Some(e2.as_str()));
        assert_eq!(replayed[1].event_id.as_deref(), Some(e3.as_str()));
        assert_eq!(replayed[0].message.method(), Some("n2"));
    }

    #[tokio::test]
    async fn test_replay_unknown_event_id() {
        let store = InMemoryEventStore::new();
        let (tx, _rx) = mpsc::channel(1);
        let result = store.replay_events_after("s1_missing", &tx).await;
        assert!(matches!(result, Err(EventStoreError::UnknownEventId(_))));
    }

    #[tokio::test]
    async fn test_eviction_is_oldest_first() {
        let store = InMemoryEventStore::with_max_events(2);
        let e1 = store.store_event("s1", &notification("n1")).await.unwrap();
        let e2 = store.store_event("s1", &notification("n2")).await.unwrap();
        let _e3 = store.store_event("s1", &notification("n3")).await.unwrap();

        let (tx, _rx) = mpsc::channel(4);
        // e1 was evicted, e2 is still resumable.
        assert!(store.replay_events_after(&e1, &tx).await.is_err());
        assert!(store.replay_events_after(&e2, &tx).await.is_ok());
    }
}
