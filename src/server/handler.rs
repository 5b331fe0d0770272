// src/server/handler.rs
use hyper::header::{HeaderValue, CONTENT_TYPE, ORIGIN};
use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use super::builder::PeerService;
use super::cors::CorsPolicy;
use crate::health::HealthTable;
use crate::proxy::Proxy;

/// Entry point for every inbound request: CORS, then `/health`, then the
/// proxy. Cloned once per accepted connection with the peer address.
#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
    health: Arc<HealthTable>,
    cors: Option<Arc<CorsPolicy>>,
    peer: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>, health: Arc<HealthTable>, cors: Option<CorsPolicy>) -> Self {
        Self {
            proxy,
            health,
            cors: cors.map(Arc::new),
            peer: None,
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let origin = req.headers().get(ORIGIN).cloned();

        if let Some(cors) = &self.cors {
            if CorsPolicy::is_preflight(&req) {
                return cors.preflight(&req);
            }
        }

        let mut response = if req.method() == Method::GET && req.uri().path() == "/health" {
            health_response(&self.health)
        } else {
            self.proxy.handle(req, self.peer).await
        };

        if let Some(cors) = &self.cors {
            cors.apply(origin.as_ref(), response.headers_mut());
        }
        response
    }
}

fn health_response(health: &HealthTable) -> Response<Body> {
    match serde_json::to_vec(&health.report()) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            tracing::error!(%err, "Failed to serialize health report");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

impl PeerService for RequestHandler {
    fn for_peer(&self, peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..self.clone()
        }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle(req).await) })
    }
}
