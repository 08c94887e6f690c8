#![doc = include_str!("../README.md")]

mod error;
pub use error::{EventStoreError, TransportError};

/// Transport-level view of JSON-RPC messages
pub mod model;
pub use model::{
    ClientJsonRpcMessage, ErrorCode, ErrorData, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, JsonRpcVersion2_0, NumberOrString, RequestId,
    ServerJsonRpcMessage, ServerSseMessage,
};

pub mod event_store;
pub use event_store::{EventId, EventStore, InMemoryEventStore, StreamId};

pub mod session;
pub use session::{session_id, SessionId, SessionIdGenerator};

pub mod transport;
pub use transport::{
    AuthInfo, MessageExtra, SendOptions, StreamableHttpServerConfig,
    StreamableHttpServerTransport, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID,
};

mod service;
pub use service::StreamableHttpService;
