use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::Router;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_streamable_http::{
    JsonRpcMessage, JsonRpcResponse, JsonRpcVersion2_0, StreamableHttpServerConfig,
    StreamableHttpServerTransport, StreamableHttpService,
};

pub async fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub transport: Arc<StreamableHttpServerTransport>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }
}

/// Spin up an axum server with the transport mounted at `/mcp` and a
/// toy protocol layer wired to the callbacks: it answers `initialize`
/// and a `greet` tool, which is all the scenarios need.
pub async fn serve(config: StreamableHttpServerConfig) -> anyhow::Result<TestServer> {
    let transport = Arc::new(StreamableHttpServerTransport::new(config));
    wire_demo_server(&transport);

    let router = Router::new().route_service("/mcp", StreamableHttpService::new(transport.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(%error, "test server shutdown with error");
        }
    });

    Ok(TestServer { addr, transport })
}

fn wire_demo_server(transport: &Arc<StreamableHttpServerTransport>) {
    let replier = transport.clone();
    transport.set_on_message(move |message, _extra| {
        let JsonRpcMessage::Request(request) = message else {
            return;
        };
        let replier = replier.clone();
        tokio::spawn(async move {
            let result = match request.method.as_str() {
                "initialize" => json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "demo-server", "version": "0.1.0"}
                }),
                "tools/call" => {
                    let name = request
                        .params
                        .as_ref()
                        .and_then(|params| params.get("arguments"))
                        .and_then(|arguments| arguments.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("world");
                    json!({
                        "content": [{"type": "text", "text": format!("Hello, {name}!")}]
                    })
                }
                _ => json!({}),
            };
            let _ = replier
                .send(JsonRpcMessage::Response(JsonRpcResponse {
                    jsonrpc: JsonRpcVersion2_0,
                    id: request.id.clone(),
                    result,
                }))
                .await;
        });
    });
}

pub fn initialize_request() -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "initialize",
        "params": {
            "clientInfo": {"name": "c", "version": "1"},
            "protocolVersion": "2025-03-26",
            "capabilities": {}
        },
        "id": "init-1"
    })
}

pub fn tool_call_request(id: &str, name: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "params": {"name": "greet", "arguments": {"name": name}},
        "id": id
    })
}

pub async fn post(
    url: &str,
    session: Option<&str>,
    body: &Value,
) -> anyhow::Result<reqwest::Response> {
    let mut request = reqwest::Client::new()
        .post(url)
        .header("accept", "application/json, text/event-stream")
        .header("content-type", "application/json")
        .body(body.to_string());
    if let Some(session) = session {
        request = request.header("mcp-session-id", session);
    }
    Ok(request.send().await?)
}

pub async fn open_get(
    url: &str,
    session: Option<&str>,
    last_event_id: Option<&str>,
) -> anyhow::Result<reqwest::Response> {
    let mut request = reqwest::Client::new()
        .get(url)
        .header("accept", "text/event-stream");
    if let Some(session) = session {
        request = request.header("mcp-session-id", session);
    }
    if let Some(last_event_id) = last_event_id {
        request = request.header("last-event-id", last_event_id);
    }
    Ok(request.send().await?)
}

/// Run the S1 handshake and hand back the assigned session id.
pub async fn initialize(server: &TestServer) -> anyhow::Result<String> {
    let response = post(&server.url(), None, &initialize_request()).await?;
    anyhow::ensure!(response.status() == 200, "initialize failed: {}", response.status());
    let session = response
        .headers()
        .get("mcp-session-id")
        .ok_or_else(|| anyhow!("initialize reply carried no session header"))?
        .to_str()?
        .to_string();
    let mut reader = SseReader::new(response);
    reader.next_event().await?;
    Ok(session)
}

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub id: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> anyhow::Result<Value> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Incremental SSE reader over a streaming response body.
pub struct SseReader {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: String,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    pub async fn next_event(&mut self) -> anyhow::Result<SseEvent> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let raw = self.buffer[..end].to_string();
                self.buffer.drain(..end + 2);
                return Ok(parse_event(&raw));
            }
            let chunk = self
                .stream
                .next()
                .await
                .ok_or_else(|| anyhow!("event stream ended"))??;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Asserts the stream stays quiet for `wait`.
    pub async fn expect_no_event(&mut self, wait: Duration) -> anyhow::Result<()> {
        match tokio::time::timeout(wait, self.next_event()).await {
            Err(_elapsed) => Ok(()),
            Ok(Ok(event)) => Err(anyhow!("unexpected event: {event:?}")),
            Ok(Err(_ended)) => Ok(()),
        }
    }
}

fn parse_event(raw: &str) -> SseEvent {
    let mut id = None;
    let mut data = String::new();
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim_start());
        }
    }
    SseEvent { id, data }
}
