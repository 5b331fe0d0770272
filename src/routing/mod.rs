// src/routing/mod.rs
mod registry;
mod router;

pub use registry::{normalize_prefix, upstream_key, ResolvedRoute, Route, UpstreamRegistry};
pub(crate) use registry::join_paths;
pub use router::{upstream_path_and_query, RoutedRequest, Router};
