// ────────────────────────────────
// src/proxy/proxy.rs
// Proxy engine: routes a request, forwards it over a pooled connection
// and streams the upstream response back.
// ────────────────────────────────

use super::body::UpstreamBody;
use super::headers::{
    append_forwarded, ensure_request_id, set_upstream_host, strip_hop_by_hop, X_REQUEST_ID,
};
use super::pool::{ConnectionPool, PoolError};
use crate::error::ProxyError;
use crate::metrics::{MetricsCollector, Timer};
use crate::routing::{RoutedRequest, Router};
use hyper::header::HOST;
use hyper::{Body, Request, Response, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Seconds clients are told to wait after the pool pushes back.
const RETRY_AFTER_SECS: u64 = 1;

pub struct Proxy {
    router: Router,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(
        router: Router,
        pool: Arc<ConnectionPool>,
        request_timeout: Duration,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            router,
            pool,
            request_timeout,
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Full request path: route, forward, and turn any failure into its
    /// client-visible status. Never fails.
    pub async fn handle(&self, mut req: Request<Body>, peer: Option<SocketAddr>) -> Response<Body> {
        let timer = Timer::new();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = ensure_request_id(req.headers_mut());

        let original_host = req
            .headers()
            .get(HOST)
            .cloned()
            .or_else(|| req.uri().authority().and_then(|a| a.as_str().parse().ok()));
        let scheme = req.uri().scheme_str().unwrap_or("http").to_string();
        append_forwarded(
            req.headers_mut(),
            peer.map(|p| p.ip()),
            original_host.as_ref(),
            &scheme,
        );

        let routed = self.router.route(req);
        let route_label = match &routed {
            Ok(r) => r.route.prefix.clone(),
            Err(_) => "unmatched".to_string(),
        };

        let result = match routed {
            Ok(routed) => self.forward(routed).await,
            Err(err) => Err(err),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    ProxyError::NoRouteMatched(_) => debug!(%path, "No route matched"),
                    _ => warn!(
                        request_id = ?request_id,
                        route = %route_label,
                        %path,
                        error = %err,
                        "Request failed"
                    ),
                }
                err.into()
            }
        };

        response.headers_mut().insert(X_REQUEST_ID, request_id.clone());

        let elapsed = timer.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_request(method.as_str(), response.status().as_u16(), &route_label, elapsed);
        }
        debug!(
            request_id = ?request_id,
            %method,
            %path,
            route = %route_label,
            status = response.status().as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        response
    }

    /// Send a routed request upstream. The deadline covers acquiring a
    /// connection, receiving the response head and streaming the body.
    pub async fn forward(&self, routed: RoutedRequest) -> Result<Response<Body>, ProxyError> {
        let RoutedRequest { mut request, route, .. } = routed;
        let deadline = Instant::now() + self.request_timeout;
        let upstream = route.upstream_key();

        strip_hop_by_hop(request.headers_mut());
        set_upstream_host(request.headers_mut(), &route.target);
        *request.version_mut() = Version::HTTP_11;

        let timed_out = || ProxyError::UpstreamTimeout {
            upstream: upstream.clone(),
            timeout: self.request_timeout,
        };

        let mut connection = timeout_at(deadline, self.pool.acquire(&route))
            .await
            .map_err(|_| timed_out())?
            .map_err(pool_error)?;

        let response = timeout_at(deadline, connection.send(request))
            .await
            .map_err(|_| timed_out())?
            .map_err(pool_error)?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let body = UpstreamBody::new(body, connection, deadline).into_body();
        Ok(Response::from_parts(parts, body))
    }
}

fn pool_error(err: PoolError) -> ProxyError {
    match err {
        PoolError::Exhausted { upstream, .. } => ProxyError::PoolExhausted {
            upstream,
            retry_after_secs: RETRY_AFTER_SECS,
        },
        other => ProxyError::UpstreamConnectionError(other.to_string()),
    }
}
