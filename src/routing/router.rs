// src/routing/router.rs
use super::registry::{join_paths, Route, UpstreamRegistry};
use crate::error::ProxyError;
use crate::health::HealthTable;
use hyper::{Body, Request, Uri};
use std::sync::Arc;

/// A request bound to a live upstream, its URI already rewritten to the
/// origin-form path the upstream expects.
#[derive(Debug)]
pub struct RoutedRequest {
    pub request: Request<Body>,
    pub route: Arc<Route>,
    pub route_index: usize,
}

/// Resolves inbound requests against the registry and refuses routes whose
/// upstream is currently marked down.
pub struct Router {
    registry: Arc<UpstreamRegistry>,
    health: Arc<HealthTable>,
}

impl Router {
    pub fn new(registry: Arc<UpstreamRegistry>, health: Arc<HealthTable>) -> Self {
        Self { registry, health }
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    pub fn route(&self, mut request: Request<Body>) -> Result<RoutedRequest, ProxyError> {
        let path = request.uri().path().to_string();

        let resolved = self
            .registry
            .resolve(&path)
            .ok_or_else(|| ProxyError::NoRouteMatched(path.clone()))?;

        if !self.health.is_healthy(resolved.index) {
            return Err(ProxyError::UpstreamUnavailable {
                prefix: resolved.route.prefix.clone(),
            });
        }

        let target = upstream_path_and_query(&resolved.route, &path, request.uri().query());
        *request.uri_mut() = target
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        tracing::trace!(
            prefix = %resolved.route.prefix,
            from = %path,
            to = %target,
            "Routed request"
        );

        Ok(RoutedRequest {
            request,
            route: resolved.route,
            route_index: resolved.index,
        })
    }
}

/// Rewritten path under the target's base path, plus the untouched query.
pub fn upstream_path_and_query(route: &Route, path: &str, query: Option<&str>) -> String {
    let rewritten = route.rewrite_path(path);
    let full = join_paths(route.target.path(), &rewritten);

    match query {
        Some(q) => format!("{}?{}", full, q),
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn router() -> (Router, Arc<HealthTable>) {
        let registry = Arc::new(UpstreamRegistry::new(vec![
            Route::new("/auth", Url::parse("http://u1").unwrap()),
            Route::new("/courses", Url::parse("http://u2").unwrap()).with_rewrite("/"),
            Route::new("/legacy", Url::parse("http://u3/v1/").unwrap()),
        ]));
        let health = Arc::new(HealthTable::new(&registry, 3));
        (Router::new(registry, health.clone()), health)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn rewrites_into_origin_form() {
        let (router, _) = router();

        let routed = router.route(get("/auth/login?next=%2F")).unwrap();
        assert_eq!(routed.request.uri(), "/login?next=%2F");
        assert_eq!(routed.route.prefix, "/auth");
        assert_eq!(routed.route_index, 0);

        let routed = router.route(get("/courses/7")).unwrap();
        assert_eq!(routed.request.uri(), "/7");

        let routed = router.route(get("/legacy/items")).unwrap();
        assert_eq!(routed.request.uri(), "/v1/items");
    }

    #[test]
    fn absolute_form_requests_use_the_path_only() {
        let (router, _) = router();
        let routed = router.route(get("http://gateway.local/auth/me")).unwrap();
        assert_eq!(routed.request.uri(), "/me");
    }

    #[test]
    fn unmatched_path_is_no_route() {
        let (router, _) = router();
        let err = router.route(get("/billing")).unwrap_err();
        assert!(matches!(err, ProxyError::NoRouteMatched(p) if p == "/billing"));
    }

    #[test]
    fn unhealthy_upstream_is_refused_without_fallback() {
        let (router, health) = router();
        for _ in 0..3 {
            health.record_failure(0);
        }

        let err = router.route(get("/auth/login")).unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable { ref prefix } if prefix == "/auth"));
        assert!(router.route(get("/courses")).is_ok());

        health.record_success(0);
        assert!(router.route(get("/auth/login")).is_ok());
    }
}
