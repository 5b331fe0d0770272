// src/server/cors.rs
use crate::config::CorsConfig;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use hyper::{Body, Method, Request, Response, StatusCode};

/// Origin allow-list applied at the edge, before any routing.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    any_origin: bool,
    origins: Vec<String>,
    methods: String,
    headers: Option<String>,
    max_age: Option<u64>,
}

impl CorsPolicy {
    /// `None` when CORS handling is switched off.
    pub fn from_config(config: &CorsConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        Some(Self {
            any_origin: config.allowed_origins.iter().any(|o| o == "*"),
            origins: config.allowed_origins.clone(),
            methods: config.allowed_methods.join(","),
            headers: if config.allowed_headers.is_empty() {
                None
            } else {
                Some(config.allowed_headers.join(","))
            },
            max_age: config.max_age_secs,
        })
    }

    pub fn is_preflight<B>(req: &Request<B>) -> bool {
        req.method() == Method::OPTIONS
            && req.headers().contains_key(ORIGIN)
            && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    fn allow_origin(&self, origin: &HeaderValue) -> Option<HeaderValue> {
        if self.any_origin {
            return Some(HeaderValue::from_static("*"));
        }
        let origin_str = origin.to_str().ok()?;
        self.origins
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(origin_str))
            .then(|| origin.clone())
    }

    /// Answer a preflight without touching any upstream.
    pub fn preflight<B>(&self, req: &Request<B>) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;

        let origin = req.headers().get(ORIGIN).cloned();
        self.apply(origin.as_ref(), response.headers_mut());

        let headers = response.headers_mut();
        if !headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
            return response;
        }

        if let Ok(methods) = HeaderValue::from_str(&self.methods) {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
        }

        let allowed_headers = match &self.headers {
            Some(list) => HeaderValue::from_str(list).ok(),
            None => req.headers().get(ACCESS_CONTROL_REQUEST_HEADERS).cloned(),
        };
        if let Some(value) = allowed_headers {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, value);
            headers.append(VARY, HeaderValue::from_static("Access-Control-Request-Headers"));
        }

        if let Some(age) = self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(age));
        }

        response
    }

    /// Stamp the allow-origin header on a response for an allowed origin.
    pub fn apply(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        let Some(origin) = origin else {
            return;
        };

        if let Some(value) = self.allow_origin(origin) {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            if !self.any_origin {
                headers.append(VARY, HeaderValue::from_static("Origin"));
            }
        }
    }
}
