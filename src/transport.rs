//! The Streamable HTTP server transport.
//!
//! A single endpoint multiplexes the whole JSON-RPC conversation:
//! POST carries client messages in (answered on a short-lived SSE
//! stream, or a buffered JSON body in JSON-response mode), GET opens
//! the standalone server-push stream, DELETE tears the session down.
//!
//! The transport owns sessions, streams, and the correlation between
//! request ids and the HTTP response that must carry their replies.
//! The upper protocol layer only ever sees [`send`], [`close`] and the
//! `on_message`/`on_close`/`on_error` callbacks.
//!
//! [`send`]: StreamableHttpServerTransport::send
//! [`close`]: StreamableHttpServerTransport::close

use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    error::TransportError,
    event_store::{EventStore, StreamId},
    model::{
        messages_from_value, ClientJsonRpcMessage, ErrorCode, RequestId, ServerJsonRpcMessage,
        ServerSseMessage,
    },
    session::{session_id, SessionId, SessionIdGenerator},
};

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

/// Stream id sentinel for the single GET-initiated server-push stream.
const STANDALONE_STREAM_ID: &str = "_GET_stream";

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Configuration fixed at construction.
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// Invoked once per session on the first `initialize` request.
    /// `None` puts the transport in stateless mode: no session id is
    /// advertised and client session headers are not validated.
    pub session_id_generator: Option<SessionIdGenerator>,
    /// When true, POSTs carrying requests are answered with one JSON
    /// body instead of an SSE stream.
    pub enable_json_response: bool,
    /// Enables resumability: every SSE frame gets a persisted event id
    /// and GET requests may replay from `last-event-id`.
    pub event_store: Option<Arc<dyn EventStore>>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            session_id_generator: Some(Arc::new(session_id)),
            enable_json_response: false,
            event_store: None,
        }
    }
}

impl StreamableHttpServerConfig {
    /// Stateless configuration: sessions are not advertised, session
    /// headers from clients are accepted as-is.
    pub fn stateless() -> Self {
        Self {
            session_id_generator: None,
            ..Default::default()
        }
    }
}

impl fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("stateful", &self.session_id_generator.is_some())
            .field("enable_json_response", &self.enable_json_response)
            .field("event_store", &self.event_store.is_some())
            .finish()
    }
}

/// Authentication details an embedder's middleware may attach to the
/// request extensions; forwarded verbatim to `on_message`.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub token: String,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<u64>,
}

/// Transport-level metadata handed to `on_message` alongside each
/// client message.
#[derive(Debug, Clone)]
pub struct MessageExtra {
    pub session_id: Option<SessionId>,
    pub auth_info: Option<AuthInfo>,
    pub headers: Arc<HeaderMap>,
}

/// Options for [`StreamableHttpServerTransport::send_with_options`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Route a server-initiated request or notification onto the
    /// stream that owns this request id instead of the standalone
    /// stream (progress updates travel with their caller).
    pub related_request_id: Option<RequestId>,
}

type OnMessage = Arc<dyn Fn(ClientJsonRpcMessage, MessageExtra) + Send + Sync>;
type OnClose = Arc<dyn Fn() + Send + Sync>;
type OnError = Arc<dyn Fn(TransportError) + Send + Sync>;

/// Replies for a JSON-response-mode POST, buffered until every request
/// id in the batch has been answered.
struct JsonResponseBuffer {
    replies: Vec<ServerJsonRpcMessage>,
    done: Option<oneshot::Sender<Vec<ServerJsonRpcMessage>>>,
}

enum StreamSink {
    Sse(mpsc::Sender<ServerSseMessage>),
    Json(JsonResponseBuffer),
}

struct StreamEntry {
    sink: StreamSink,
    /// Request ids still awaiting a reply; the stream ends when this
    /// drains. Always empty for the standalone stream.
    pending: HashSet<RequestId>,
}

#[derive(Default)]
struct StreamTables {
    streams: HashMap<StreamId, StreamEntry>,
    requests: HashMap<RequestId, StreamId>,
}

/// Server-side Streamable HTTP transport for one logical session.
pub struct StreamableHttpServerTransport {
    config: StreamableHttpServerConfig,
    session: RwLock<Option<SessionId>>,
    initialized: AtomicBool,
    closed: AtomicBool,
    tables: Arc<Mutex<StreamTables>>,
    on_message: RwLock<Option<OnMessage>>,
    on_close: RwLock<Option<OnClose>>,
    on_error: RwLock<Option<OnError>>,
}

impl fmt::Debug for StreamableHttpServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpServerTransport")
            .field("config", &self.config)
            .field("session_id", &self.session_id())
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl StreamableHttpServerTransport {
    pub fn new(config: StreamableHttpServerConfig) -> Self {
        Self {
            config,
            session: RwLock::new(None),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tables: Arc::new(Mutex::new(StreamTables::default())),
            on_message: RwLock::new(None),
            on_close: RwLock::new(None),
            on_error: RwLock::new(None),
        }
    }

    /// The session id assigned on `initialize`, absent before the
    /// handshake and in stateless mode.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_on_message(
        &self,
        callback: impl Fn(ClientJsonRpcMessage, MessageExtra) + Send + Sync + 'static,
    ) {
        *self
            .on_message
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn set_on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .on_close
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn set_on_error(&self, callback: impl Fn(TransportError) + Send + Sync + 'static) {
        *self
            .on_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Entry point: feed one HTTP request in, get the HTTP response
    /// out. `pre_parsed` overrides the raw body when the embedder has
    /// already parsed it.
    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
        pre_parsed: Option<Value>,
    ) -> Response<Body>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return self.error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::BAD_REQUEST,
                "Transport closed",
            );
        }

        let method = req.method().clone();
        tracing::debug!(%method, uri = %req.uri(), "incoming request");
        if method == Method::POST {
            self.handle_post(req, pre_parsed).await
        } else if method == Method::GET {
            self.handle_get(req).await
        } else if method == Method::DELETE {
            self.handle_delete(req).await
        } else {
            let mut response = self.error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                ErrorCode::BAD_REQUEST,
                "Method not allowed",
            );
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, POST, DELETE"));
            response
        }
    }

    async fn handle_post<B>(&self, req: Request<B>, pre_parsed: Option<Value>) -> Response<Body>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let headers = Arc::new(parts.headers);

        let accept = header_str(&headers, header::ACCEPT.as_str());
        if !accept
            .is_some_and(|value| value.contains(JSON_MIME_TYPE) && value.contains(EVENT_STREAM_MIME_TYPE))
        {
            return self.error_response(
                StatusCode::NOT_ACCEPTABLE,
                ErrorCode::BAD_REQUEST,
                "Client must accept both application/json and text/event-stream",
            );
        }

        let content_type = header_str(&headers, header::CONTENT_TYPE.as_str());
        if !content_type.is_some_and(|value| value.starts_with(JSON_MIME_TYPE)) {
            return self.error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ErrorCode::BAD_REQUEST,
                "Content-Type must be application/json",
            );
        }

        // A pre-parsed body wins over the raw one.
        let raw = match pre_parsed {
            Some(value) => value,
            None => {
                let bytes = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(error) => {
                        self.report_error(TransportError::Body(error.into().to_string()));
                        return self.error_response(
                            StatusCode::BAD_REQUEST,
                            ErrorCode::PARSE_ERROR,
                            "Parse error",
                        );
                    }
                };
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => value,
                    Err(_) => {
                        return self.error_response(
                            StatusCode::BAD_REQUEST,
                            ErrorCode::PARSE_ERROR,
                            "Parse error",
                        );
                    }
                }
            }
        };

        let messages = match messages_from_value(raw) {
            Ok(messages) => messages,
            Err(_) => {
                return self.error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::INVALID_REQUEST,
                    "Invalid Request",
                );
            }
        };

        let initialize_count = messages
            .iter()
            .filter(|message| message.is_initialize_request())
            .count();
        if initialize_count > 1 {
            return self.error_response(
                StatusCode::BAD_REQUEST,
                ErrorCode::INVALID_REQUEST,
                "Only one initialization request is allowed",
            );
        }

        if initialize_count == 1 {
            if self
                .initialized
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return self.error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::INVALID_REQUEST,
                    "Server already initialized",
                );
            }
            if let Some(generator) = &self.config.session_id_generator {
                let id = generator();
                tracing::info!(session_id = %id, "session created");
                *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(id);
            }
        } else {
            if !self.initialized.load(Ordering::SeqCst) {
                return self.error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::BAD_REQUEST,
                    "Server not initialized",
                );
            }
            if let Some(response) = self.validate_session(&headers) {
                return response;
            }
        }

        let extra = MessageExtra {
            session_id: self.session_id(),
            auth_info: parts.extensions.get::<AuthInfo>().cloned(),
            headers: headers.clone(),
        };

        let request_ids: Vec<RequestId> = messages
            .iter()
            .filter_map(|message| message.request_id().cloned())
            .collect();

        // Only notifications and responses: acknowledge and dispatch.
        if request_ids.is_empty() {
            for message in messages {
                self.dispatch_message(message, extra.clone());
            }
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::ACCEPTED;
            self.apply_session_header(&mut response);
            return response;
        }

        let stream_id: StreamId = uuid::Uuid::new_v4().to_string();
        tracing::debug!(%stream_id, requests = request_ids.len(), "request stream opened");

        if self.config.enable_json_response {
            self.handle_post_json(stream_id, request_ids, messages, extra)
                .await
        } else {
            self.handle_post_sse(stream_id, request_ids, messages, extra)
                .await
        }
    }

    async fn handle_post_sse(
        &self,
        stream_id: StreamId,
        request_ids: Vec<RequestId>,
        messages: Vec<ClientJsonRpcMessage>,
        extra: MessageExtra,
    ) -> Response<Body> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        {
            let mut tables = self.tables.lock().await;
            tables.streams.insert(
                stream_id.clone(),
                StreamEntry {
                    sink: StreamSink::Sse(tx),
                    pending: request_ids.iter().cloned().collect(),
                },
            );
            for id in &request_ids {
                tables.requests.insert(id.clone(), stream_id.clone());
            }
        }
        for message in messages {
            self.dispatch_message(message, extra.clone());
        }
        self.sse_response(rx)
    }

    async fn handle_post_json(
        &self,
        stream_id: StreamId,
        request_ids: Vec<RequestId>,
        messages: Vec<ClientJsonRpcMessage>,
        extra: MessageExtra,
    ) -> Response<Body> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut tables = self.tables.lock().await;
            tables.streams.insert(
                stream_id.clone(),
                StreamEntry {
                    sink: StreamSink::Json(JsonResponseBuffer {
                        replies: Vec::new(),
                        done: Some(done_tx),
                    }),
                    pending: request_ids.iter().cloned().collect(),
                },
            );
            for id in &request_ids {
                tables.requests.insert(id.clone(), stream_id.clone());
            }
        }
        let mut guard = StreamCleanupGuard {
            tables: self.tables.clone(),
            stream_id: Some(stream_id),
        };

        for message in messages {
            self.dispatch_message(message, extra.clone());
        }

        match done_rx.await {
            Ok(replies) => {
                guard.disarm();
                let body = if request_ids.len() > 1 {
                    serde_json::to_string(&replies).unwrap_or_else(|_| "[]".to_string())
                } else {
                    replies
                        .first()
                        .and_then(|reply| serde_json::to_string(reply).ok())
                        .unwrap_or_else(|| "{}".to_string())
                };
                let mut response = Response::new(Body::from(body));
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE));
                self.apply_session_header(&mut response);
                response
            }
            // Dropped without completion: the transport was closed.
            Err(_) => self.error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::BAD_REQUEST,
                "Transport closed",
            ),
        }
    }

    async fn handle_get<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body + Send,
    {
        let (parts, _body) = req.into_parts();
        let headers = parts.headers;

        let accept = header_str(&headers, header::ACCEPT.as_str());
        if !accept.is_some_and(|value| value.contains(EVENT_STREAM_MIME_TYPE)) {
            return self.error_response(
                StatusCode::NOT_ACCEPTABLE,
                ErrorCode::BAD_REQUEST,
                "Client must accept text/event-stream",
            );
        }

        if let Some(response) = self.validate_session(&headers) {
            return response;
        }

        let last_event_id = header_str(&headers, HEADER_LAST_EVENT_ID).map(str::to_owned);
        if let (Some(last_event_id), Some(store)) =
            (last_event_id, self.config.event_store.clone())
        {
            return self.resume_stream(store, last_event_id);
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        {
            let mut tables = self.tables.lock().await;
            if let Some(entry) = tables.streams.get(STANDALONE_STREAM_ID) {
                // A slot held by a disconnected client is free again.
                let stale =
                    matches!(&entry.sink, StreamSink::Sse(existing) if existing.is_closed());
                if !stale {
                    return self.error_response(
                        StatusCode::CONFLICT,
                        ErrorCode::BAD_REQUEST,
                        "Only one SSE stream is allowed per session",
                    );
                }
            }
            tables.streams.insert(
                STANDALONE_STREAM_ID.to_string(),
                StreamEntry {
                    sink: StreamSink::Sse(tx),
                    pending: HashSet::new(),
                },
            );
        }
        tracing::debug!("standalone stream opened");
        self.sse_response(rx)
    }

    /// Resumption: replay missed events onto a fresh stream, then adopt
    /// the stream id the event store reports so new events continue it.
    fn resume_stream(&self, store: Arc<dyn EventStore>, last_event_id: String) -> Response<Body> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let tables = self.tables.clone();
        let on_error = self.error_callback();
        tokio::spawn(async move {
            match store.replay_events_after(&last_event_id, &tx).await {
                Ok(stream_id) => {
                    tracing::debug!(%stream_id, %last_event_id, "stream resumed");
                    let mut tables = tables.lock().await;
                    tables.streams.insert(
                        stream_id,
                        StreamEntry {
                            sink: StreamSink::Sse(tx),
                            pending: HashSet::new(),
                        },
                    );
                }
                // Dropping tx ends the response; the client falls back
                // to a fresh stream.
                Err(error) => invoke_error(on_error, TransportError::EventStore(error)),
            }
        });
        self.sse_response(rx)
    }

    async fn handle_delete<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body + Send,
    {
        let (parts, _body) = req.into_parts();
        if let Some(response) = self.validate_session(&parts.headers) {
            return response;
        }
        let session = self.session_id();
        if let Some(id) = &session {
            tracing::info!(session_id = %id, "session terminated by client");
        }
        let _ = self.close().await;

        let mut response = Response::new(Body::empty());
        if let Some(id) = session {
            if let Ok(value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(HEADER_SESSION_ID, value);
            }
        }
        response
    }

    /// Session check for GET, DELETE and non-initialize POST. `None`
    /// means the request may proceed.
    fn validate_session(&self, headers: &HeaderMap) -> Option<Response<Body>> {
        if self.config.session_id_generator.is_none() {
            return None;
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Some(self.error_response(
                StatusCode::BAD_REQUEST,
                ErrorCode::BAD_REQUEST,
                "Server not initialized",
            ));
        }
        let current = self.session_id()?;
        match header_str(headers, HEADER_SESSION_ID) {
            None => Some(self.error_response(
                StatusCode::BAD_REQUEST,
                ErrorCode::BAD_REQUEST,
                "Bad Request",
            )),
            Some(value) if value != current.as_ref() => Some(self.error_response(
                StatusCode::NOT_FOUND,
                ErrorCode::SESSION_NOT_FOUND,
                "Session not found",
            )),
            Some(_) => None,
        }
    }

    /// Emit one message to the client. Responses go to the stream that
    /// carried their request; everything else goes to the standalone
    /// stream unless `related_request_id` redirects it.
    pub async fn send(&self, message: ServerJsonRpcMessage) -> Result<(), TransportError> {
        self.send_with_options(message, SendOptions::default()).await
    }

    pub async fn send_with_options(
        &self,
        message: ServerJsonRpcMessage,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let is_response = message.is_response();
        let target = message
            .response_id()
            .cloned()
            .or(options.related_request_id);

        match target {
            Some(request_id) => self.send_correlated(message, request_id, is_response).await,
            None => self.send_standalone(message).await,
        }
    }

    async fn send_standalone(&self, message: ServerJsonRpcMessage) -> Result<(), TransportError> {
        let tx = {
            let tables = self.tables.lock().await;
            match tables.streams.get(STANDALONE_STREAM_ID).map(|entry| &entry.sink) {
                Some(StreamSink::Sse(tx)) => Some(tx.clone()),
                _ => None,
            }
        };
        let Some(tx) = tx else {
            // No standalone stream open: server-initiated messages are
            // discarded, not queued.
            tracing::debug!("no standalone stream open, dropping server-initiated message");
            return Ok(());
        };

        let message = Arc::new(message);
        let event_id = self.store_event(STANDALONE_STREAM_ID, &message).await;
        if tx.send(ServerSseMessage { event_id, message }).await.is_err() {
            self.cleanup_stream(STANDALONE_STREAM_ID).await;
            tracing::debug!("standalone stream disconnected, dropping message");
        }
        Ok(())
    }

    async fn send_correlated(
        &self,
        message: ServerJsonRpcMessage,
        request_id: RequestId,
        is_response: bool,
    ) -> Result<(), TransportError> {
        enum Route {
            Vanished,
            JsonHandled(Option<(oneshot::Sender<Vec<ServerJsonRpcMessage>>, Vec<ServerJsonRpcMessage>)>),
            Sse(StreamId, mpsc::Sender<ServerSseMessage>),
        }

        let mut message = Some(message);
        let route = {
            let mut guard = self.tables.lock().await;
            let tables = &mut *guard;
            match tables.requests.get(&request_id).cloned() {
                None => Route::Vanished,
                Some(stream_id) => match tables.streams.get_mut(&stream_id) {
                    None => {
                        tables.requests.remove(&request_id);
                        Route::Vanished
                    }
                    Some(entry) => match &mut entry.sink {
                        StreamSink::Sse(tx) => Route::Sse(stream_id.clone(), tx.clone()),
                        StreamSink::Json(buffer) => {
                            if is_response {
                                if let Some(reply) = message.take() {
                                    buffer.replies.push(reply);
                                }
                                let finished = entry.pending.remove(&request_id)
                                    && entry.pending.is_empty();
                                tables.requests.remove(&request_id);
                                if finished {
                                    match tables.streams.remove(&stream_id) {
                                        Some(StreamEntry {
                                            sink: StreamSink::Json(buffer),
                                            ..
                                        }) => Route::JsonHandled(
                                            buffer.done.map(|done| (done, buffer.replies)),
                                        ),
                                        _ => Route::JsonHandled(None),
                                    }
                                } else {
                                    Route::JsonHandled(None)
                                }
                            } else {
                                // A buffered JSON body has nowhere to
                                // put interim messages.
                                tracing::debug!(%stream_id, "dropping non-response message for json-mode stream");
                                Route::JsonHandled(None)
                            }
                        }
                    },
                },
            }
        };

        let (stream_id, tx) = match route {
            Route::Vanished => {
                self.report_error(TransportError::StreamVanished(request_id));
                return Ok(());
            }
            Route::JsonHandled(completion) => {
                if let Some((done, replies)) = completion {
                    let _ = done.send(replies);
                }
                return Ok(());
            }
            Route::Sse(stream_id, tx) => (stream_id, tx),
        };

        let Some(message) = message.take() else {
            return Ok(());
        };
        let message = Arc::new(message);
        let event_id = self.store_event(&stream_id, &message).await;
        if tx.send(ServerSseMessage { event_id, message }).await.is_err() {
            self.cleanup_stream(&stream_id).await;
            self.report_error(TransportError::StreamVanished(request_id));
            return Ok(());
        }

        if is_response {
            let mut tables = self.tables.lock().await;
            tables.requests.remove(&request_id);
            let finished = tables
                .streams
                .get_mut(&stream_id)
                .map(|entry| entry.pending.remove(&request_id) && entry.pending.is_empty())
                .unwrap_or(false);
            if finished {
                // All ids answered: dropping the sender ends the
                // response stream.
                tables.streams.remove(&stream_id);
                tracing::debug!(%stream_id, "request stream completed");
            }
        }
        Ok(())
    }

    /// Tear down every open stream and invalidate the session.
    /// Idempotent; afterwards every handler answers 503.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut tables = self.tables.lock().await;
            tables.streams.clear();
            tables.requests.clear();
        }
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::debug!("transport closed");
        self.dispatch_close();
        Ok(())
    }

    async fn store_event(
        &self,
        stream_id: &str,
        message: &Arc<ServerJsonRpcMessage>,
    ) -> Option<String> {
        let store = self.config.event_store.as_ref()?;
        match store.store_event(stream_id, message).await {
            Ok(event_id) => Some(event_id),
            // Resumability is best-effort: the frame is still written,
            // just without an id.
            Err(error) => {
                self.report_error(TransportError::EventStore(error));
                None
            }
        }
    }

    async fn cleanup_stream(&self, stream_id: &str) {
        let mut tables = self.tables.lock().await;
        tables.streams.remove(stream_id);
        tables.requests.retain(|_, mapped| mapped != stream_id);
    }

    fn sse_response(&self, rx: mpsc::Receiver<ServerSseMessage>) -> Response<Body> {
        let stream =
            ReceiverStream::new(rx).map(|message| Ok::<_, Infallible>(sse_frame(&message)));
        let mut response = Response::new(Body::from_stream(stream));
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
        );
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-transform"),
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        self.apply_session_header(&mut response);
        response
    }

    fn error_response(
        &self,
        status: StatusCode,
        code: ErrorCode,
        message: &str,
    ) -> Response<Body> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "error": { "code": code.0, "message": message },
            "id": null,
        });
        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE));
        self.apply_session_header(&mut response);
        response
    }

    fn apply_session_header(&self, response: &mut Response<Body>) {
        if let Some(id) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(HEADER_SESSION_ID, value);
            }
        }
    }

    fn dispatch_message(&self, message: ClientJsonRpcMessage, extra: MessageExtra) {
        let callback = self
            .on_message
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(message, extra))).is_err() {
                    self.report_error(TransportError::HandlerPanic);
                }
            }
            None => tracing::warn!("message received but no on_message handler registered"),
        }
    }

    fn dispatch_close(&self) {
        let callback = self
            .on_close
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            let _ = catch_unwind(AssertUnwindSafe(|| callback()));
        }
    }

    fn error_callback(&self) -> Option<OnError> {
        self.on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn report_error(&self, error: TransportError) {
        invoke_error(self.error_callback(), error);
    }
}

fn invoke_error(callback: Option<OnError>, error: TransportError) {
    tracing::warn!(%error, "transport error");
    if let Some(callback) = callback {
        let _ = catch_unwind(AssertUnwindSafe(|| callback(error)));
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// One SSE frame: optional `id:` line, one `data:` line, blank line.
/// No `event:` field, no comments, no keepalive pings.
fn sse_frame(message: &ServerSseMessage) -> Bytes {
    let data =
        serde_json::to_string(message.message.as_ref()).unwrap_or_else(|_| "{}".to_string());
    let mut frame = String::new();
    if let Some(id) = &message.event_id {
        frame.push_str(&format!("id: {id}\n"));
    }
    frame.push_str(&format!("data: {data}\n\n"));
    Bytes::from(frame)
}

/// Frees a JSON-mode stream's bookkeeping if the client goes away
/// before the buffered response completes.
struct StreamCleanupGuard {
    tables: Arc<Mutex<StreamTables>>,
    stream_id: Option<StreamId>,
}

impl StreamCleanupGuard {
    fn disarm(&mut self) {
        self.stream_id = None;
    }
}

impl Drop for StreamCleanupGuard {
    fn drop(&mut self) {
        let Some(stream_id) = self.stream_id.take() else {
            return;
        };
        let tables = self.tables.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut tables = tables.lock().await;
                if tables.streams.remove(&stream_id).is_some() {
                    tables.requests.retain(|_, mapped| mapped != &stream_id);
                    tracing::debug!(%stream_id, "client disconnected before json response completed");
                }
            });
        }
    }
}
