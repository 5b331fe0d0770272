// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use url::Url;

const ENV_PREFIX: &str = "GATEWAY";

/// Load configuration from a file (YAML or JSON), or from the legacy
/// environment when no file is given. `GATEWAY_*` variables override
/// scalar settings in both cases.
pub async fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_file(path.as_ref()).await?,
        None => Config::from_legacy(read_legacy_env()?)?,
    };

    read_env_overrides()?.apply(&mut config);

    config.validate()?;
    Ok(config)
}

async fn load_file(path: &Path) -> Result<Config> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&contents).context("Failed to parse YAML config")?
        }
        _ => serde_json::from_str(&contents).context("Failed to parse JSON config")?,
    };

    Ok(config)
}

/// Variables understood when the gateway runs without a config file.
#[derive(Debug, Default, Deserialize)]
pub struct LegacyEnv {
    pub port: Option<u16>,
    pub users_service_url: Option<Url>,
    pub academic_service_url: Option<Url>,
}

fn read_legacy_env() -> Result<LegacyEnv> {
    ::config::Config::builder()
        .add_source(::config::Environment::default().try_parsing(true))
        .build()
        .and_then(|env| env.try_deserialize())
        .context("Failed to read service URLs from the environment")
}

impl Config {
    /// Two-route layout: `/auth` to the users service with the prefix
    /// stripped, `/courses` to the academic service rewritten onto `/`.
    pub fn from_legacy(env: LegacyEnv) -> Result<Self> {
        let users = match env.users_service_url {
            Some(url) => url,
            None => Url::parse("http://localhost:3001")?,
        };
        let academic = match env.academic_service_url {
            Some(url) => url,
            None => Url::parse("http://localhost:3002")?,
        };

        Ok(Self {
            listen: SocketAddr::from(([0, 0, 0, 0], env.port.unwrap_or(3000))),
            routes: vec![
                RouteConfig {
                    prefix: "/auth".to_string(),
                    target: users,
                    strip_prefix: true,
                    rewrite_to: None,
                },
                RouteConfig {
                    prefix: "/courses".to_string(),
                    target: academic,
                    strip_prefix: false,
                    rewrite_to: Some("/".to_string()),
                },
            ],
            request_timeout_ms: 30_000,
            shutdown_grace_secs: 30,
            health_check: HealthCheckConfig::default(),
            pool: PoolConfig::default(),
            cors: CorsConfig::default(),
            metrics: MetricsConfig::default(),
        })
    }
}

/// Scalar settings that may be overridden with `GATEWAY_<NAME>`.
#[derive(Debug, Default, Deserialize)]
pub struct EnvOverrides {
    pub listen: Option<SocketAddr>,
    pub request_timeout_ms: Option<u64>,
    pub health_interval_secs: Option<u64>,
    pub health_timeout_ms: Option<u64>,
    pub unhealthy_threshold: Option<u32>,
    pub pool_max_connections: Option<usize>,
    pub pool_max_idle: Option<usize>,
    pub metrics_enabled: Option<bool>,
    pub metrics_port: Option<u16>,
}

fn read_env_overrides() -> Result<EnvOverrides> {
    ::config::Config::builder()
        .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()
        .and_then(|env| env.try_deserialize())
        .context("Failed to read GATEWAY_* overrides")
}

impl EnvOverrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout_ms = ms;
        }
        if let Some(secs) = self.health_interval_secs {
            config.health_check.interval_secs = secs;
        }
        if let Some(ms) = self.health_timeout_ms {
            config.health_check.timeout_ms = ms;
        }
        if let Some(threshold) = self.unhealthy_threshold {
            config.health_check.unhealthy_threshold = threshold;
        }
        if let Some(max) = self.pool_max_connections {
            config.pool.max_connections = max;
        }
        if let Some(max) = self.pool_max_idle {
            config.pool.max_idle = max;
        }
        if let Some(enabled) = self.metrics_enabled {
            config.metrics.enabled = enabled;
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = port;
        }
    }
}
