use crate::model::RequestId;

/// Errors surfaced by the transport, either as return values of
/// [`send`](crate::StreamableHttpServerTransport::send) or through the
/// `on_error` callback.
///
/// Client protocol errors (bad headers, bad JSON, wrong state) never
/// show up here; they are answered directly on the HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("no open stream for request id {0}")]
    StreamVanished(RequestId),
    #[error("message handler panicked")]
    HandlerPanic,
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("event store: {0}")]
    EventStore(#[from] EventStoreError),
    #[error("serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from an [`EventStore`](crate::EventStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("unknown event id: {0}")]
    UnknownEventId(String),
    #[error("stream closed during replay")]
    ReplayInterrupted,
    #[error("{0}")]
    Other(String),
}
