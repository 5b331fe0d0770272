// src/gateway.rs
use crate::config::Config;
use crate::health::{HealthChecker, HealthTable};
use crate::metrics::MetricsCollector;
use crate::proxy::{ConnectionPool, Proxy};
use crate::routing::{Router, UpstreamRegistry};
use crate::server::{CorsPolicy, RequestHandler};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Every long-lived component, wired together from one `Config`.
///
/// The registry and health table are shared by reference: the prober is
/// the only writer of health state, the router and `/health` only read it.
pub struct Gateway {
    pub registry: Arc<UpstreamRegistry>,
    pub health: Arc<HealthTable>,
    pub pool: Arc<ConnectionPool>,
    pub checker: Arc<HealthChecker>,
    pub handler: RequestHandler,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: &Config, metrics: Option<Arc<MetricsCollector>>) -> Result<Self> {
        let registry = Arc::new(UpstreamRegistry::from_config(&config.routes));
        let health = Arc::new(HealthTable::new(
            &registry,
            config.health_check.unhealthy_threshold,
        ));

        if let Some(metrics) = &metrics {
            metrics.update_upstream_counts(health.healthy_count(), registry.len());
        }

        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), metrics.clone()));
        let checker = Arc::new(HealthChecker::new(
            config.health_check.clone(),
            registry.clone(),
            health.clone(),
            metrics.clone(),
        )?);

        let router = Router::new(registry.clone(), health.clone());
        let proxy = Arc::new(Proxy::new(
            router,
            pool.clone(),
            config.request_timeout(),
            metrics,
        ));
        let handler = RequestHandler::new(proxy, health.clone(), CorsPolicy::from_config(&config.cors));

        for route in registry.routes() {
            tracing::info!(prefix = %route.prefix, upstream = %route.target, "Registered route");
        }

        Ok(Self {
            registry,
            health,
            pool,
            checker,
            handler,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start the health prober and the idle-connection reaper.
    pub fn start_background(&self) {
        let prober = tokio::spawn(self.checker.clone().start());
        let reaper = self.pool.spawn_reaper();

        match self.background.lock() {
            Ok(mut tasks) => tasks.extend([prober, reaper]),
            Err(poisoned) => poisoned.into_inner().extend([prober, reaper]),
        }
    }

    pub fn shutdown(&self) {
        self.checker.shutdown();

        let tasks = match self.background.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }
}
