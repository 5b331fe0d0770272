// src/lib.rs
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod server;

pub use error::ProxyError;
pub use gateway::Gateway;
