//! `tower` service adapter, for mounting the transport in an `axum`
//! (or any hyper-based) router.

use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::body::Body;
use http::{Request, Response};

use crate::transport::StreamableHttpServerTransport;

/// Routes every request on its path to one
/// [`StreamableHttpServerTransport`].
///
/// ```ignore
/// let router = Router::new().route_service("/mcp", StreamableHttpService::new(transport));
/// ```
#[derive(Clone)]
pub struct StreamableHttpService {
    transport: Arc<StreamableHttpServerTransport>,
}

impl StreamableHttpService {
    pub fn new(transport: Arc<StreamableHttpServerTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<StreamableHttpServerTransport> {
        &self.transport
    }
}

impl<B> tower_service::Service<Request<B>> for StreamableHttpService
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let transport = self.transport.clone();
        Box::pin(async move { Ok(transport.handle_request(req, None).await) })
    }
}
