// src/error.rs
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Body, Response, StatusCode};
use std::time::Duration;

/// Every way a proxied request can fail before the upstream's own
/// status line reaches the client.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no route matches {0}")]
    NoRouteMatched(String),

    #[error("upstream for {prefix} is unavailable")]
    UpstreamUnavailable { prefix: String },

    #[error("too many in-flight requests to {upstream}")]
    PoolExhausted { upstream: String, retry_after_secs: u64 },

    #[error("upstream {upstream} did not answer within {timeout:?}")]
    UpstreamTimeout { upstream: String, timeout: Duration },

    #[error("upstream connection error: {0}")]
    UpstreamConnectionError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRouteMatched(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnectionError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NoRouteMatched(_) => "no_route_matched",
            ProxyError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ProxyError::PoolExhausted { .. } => "pool_exhausted",
            ProxyError::UpstreamTimeout { .. } => "upstream_timeout",
            ProxyError::UpstreamConnectionError(_) => "upstream_connection_error",
            ProxyError::InvalidRequest(_) => "invalid_request",
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let payload = serde_json::json!({
            "error": err.kind(),
            "message": err.to_string(),
        });

        let mut response = Response::new(Body::from(payload.to_string()));
        *response.status_mut() = err.status();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let ProxyError::PoolExhausted { retry_after_secs, .. } = err {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }

        response
    }
}
