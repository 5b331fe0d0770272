//
// src/proxy/mod.rs
//
mod body;
pub mod headers;
mod pool;
mod proxy;

pub use body::{BodyError, UpstreamBody};
pub use pool::{ConnectionPool, PoolError, PooledConnection};
pub use proxy::Proxy;
pub use crate::error::ProxyError;
