// src/config/models.rs
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one route must be configured")]
    NoRoutes,

    #[error("route prefix {0:?} must start with '/'")]
    InvalidPrefix(String),

    #[error("rewrite target {0:?} must start with '/'")]
    InvalidRewrite(String),

    #[error("upstream {0} must be an http or https URL with a host")]
    InvalidTarget(Url),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    pub routes: Vec<RouteConfig>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long open connections may keep running after a shutdown signal.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    pub target: Url,

    /// Remove the matched prefix before forwarding.
    #[serde(default = "default_true")]
    pub strip_prefix: bool,

    /// Replace the matched prefix with this path instead. Takes precedence
    /// over `strip_prefix`.
    #[serde(default)]
    pub rewrite_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Cap on concurrent in-flight requests per upstream.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,

    /// Empty means the request's `Access-Control-Request-Headers` are reflected.
    #[serde(default)]
    pub allowed_headers: Vec<String>,

    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(ConfigError::InvalidPrefix(route.prefix.clone()));
            }
            if let Some(rewrite) = &route.rewrite_to {
                if !rewrite.starts_with('/') {
                    return Err(ConfigError::InvalidRewrite(rewrite.clone()));
                }
            }
            let scheme_ok = matches!(route.target.scheme(), "http" | "https");
            if !scheme_ok || route.target.host_str().is_none() {
                return Err(ConfigError::InvalidTarget(route.target.clone()));
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("request_timeout_ms"));
        }
        if self.health_check.interval_secs == 0 {
            return Err(ConfigError::Zero("health_check.interval_secs"));
        }
        if self.health_check.timeout_ms == 0 {
            return Err(ConfigError::Zero("health_check.timeout_ms"));
        }
        if self.health_check.unhealthy_threshold == 0 {
            return Err(ConfigError::Zero("health_check.unhealthy_threshold"));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Zero("pool.max_connections"));
        }

        Ok(())
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_ms: default_health_timeout_ms(),
            path: default_health_path(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle: default_max_idle(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: default_allowed_origins(),
            allowed_methods: default_allowed_methods(),
            allowed_headers: Vec::new(),
            max_age_secs: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_max_connections() -> usize {
    128
}

fn default_max_idle() -> usize {
    16
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "HEAD", "PUT", "PATCH", "POST", "DELETE"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
