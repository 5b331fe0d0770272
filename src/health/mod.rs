// src/health/mod.rs
mod checker;
mod status;

pub use checker::{probe_url, HealthChecker, ProbeResult};
pub use status::{HealthReport, HealthTable, Transition, UpstreamHealth, UpstreamStatus};
