// src/routing/registry.rs
use crate::config::RouteConfig;
use std::sync::Arc;
use url::Url;

/// A configured prefix and the upstream it forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub target: Url,
    pub strip_prefix: bool,
    pub rewrite_to: Option<String>,
}

impl Route {
    /// Route with prefix stripping enabled, the common case.
    pub fn new(prefix: &str, target: Url) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
            target,
            strip_prefix: true,
            rewrite_to: None,
        }
    }

    pub fn from_config(config: &RouteConfig) -> Self {
        Self {
            prefix: normalize_prefix(&config.prefix),
            target: config.target.clone(),
            strip_prefix: config.strip_prefix,
            rewrite_to: config.rewrite_to.clone(),
        }
    }

    pub fn with_strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    pub fn with_rewrite(mut self, rewrite_to: impl Into<String>) -> Self {
        self.rewrite_to = Some(rewrite_to.into());
        self
    }

    /// Segment-aware prefix test: `/auth` matches `/auth` and `/auth/x`,
    /// never `/authz`.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" || path == self.prefix {
            return true;
        }
        path.starts_with(self.prefix.as_str())
            && path.as_bytes().get(self.prefix.len()) == Some(&b'/')
    }

    /// Path as the upstream should see it, relative to the target's base
    /// path. Callers must have checked `matches` first.
    pub fn rewrite_path(&self, path: &str) -> String {
        let remainder = if self.prefix == "/" {
            path
        } else {
            path.get(self.prefix.len()..).unwrap_or("")
        };

        if let Some(replacement) = &self.rewrite_to {
            return join_paths(replacement, remainder);
        }

        if !self.strip_prefix {
            return path.to_string();
        }

        if remainder.is_empty() {
            "/".to_string()
        } else {
            remainder.to_string()
        }
    }

    /// `scheme://host:port`, the key connections are pooled under.
    pub fn upstream_key(&self) -> String {
        upstream_key(&self.target)
    }
}

pub fn upstream_key(url: &Url) -> String {
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or("unknown"),
        url.port_or_known_default().unwrap_or(80)
    )
}

/// Leading slash, no trailing slash except for the root.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

pub(crate) fn join_paths(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    match (base.is_empty(), rest.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => base.to_string(),
        _ => format!("{}{}", base, rest),
    }
}

/// A route picked by `UpstreamRegistry::resolve`, with its registration
/// index so health state can be looked up without hashing.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub index: usize,
    pub route: Arc<Route>,
}

/// Static set of routes, fixed at startup.
#[derive(Debug, Clone)]
pub struct UpstreamRegistry {
    routes: Vec<Arc<Route>>,
}

impl UpstreamRegistry {
    pub fn new(routes: Vec<Route>) -> Self {
        for (i, route) in routes.iter().enumerate() {
            if routes[..i].iter().any(|earlier| earlier.prefix == route.prefix) {
                tracing::warn!(
                    prefix = %route.prefix,
                    "Duplicate route prefix, the later registration takes precedence"
                );
            }
        }

        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(configs: &[RouteConfig]) -> Self {
        Self::new(configs.iter().map(Route::from_config).collect())
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Longest matching prefix wins; on equal length the later
    /// registration wins.
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        let mut best: Option<(usize, &Arc<Route>)> = None;

        for (index, route) in self.routes.iter().enumerate() {
            if !route.matches(path) {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, current)) => route.prefix.len() >= current.prefix.len(),
            };
            if better {
                best = Some((index, route));
            }
        }

        best.map(|(index, route)| ResolvedRoute {
            index,
            route: route.clone(),
        })
    }
}
