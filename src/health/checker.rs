// src/health/checker.rs
use super::status::{HealthTable, Transition};
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::routing::{Route, UpstreamRegistry};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Periodically probes every upstream and feeds the outcome into the
/// shared `HealthTable`.
pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: Arc<UpstreamRegistry>,
    table: Arc<HealthTable>,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ProbeResult {
    pub prefix: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<UpstreamRegistry>,
        table: Arc<HealthTable>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to create health check client")?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Ok(Self {
            config,
            registry,
            table,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health prober with interval: {:?}",
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health prober shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Probe every upstream once, concurrently, and apply the results.
    pub async fn run_once(&self) -> Vec<ProbeResult> {
        let probes = self
            .registry
            .routes()
            .iter()
            .enumerate()
            .map(|(index, route)| self.check_upstream(index, route));

        let results = futures::future::join_all(probes).await;

        if let Some(metrics) = &self.metrics {
            metrics.update_upstream_counts(self.table.healthy_count(), self.registry.len());
        }

        let unhealthy = results.iter().filter(|r| !r.healthy).count();
        debug!(
            "Probe round complete: {} passed, {} failed",
            results.len() - unhealthy,
            unhealthy
        );

        results
    }

    async fn check_upstream(&self, index: usize, route: &Route) -> ProbeResult {
        let start = std::time::Instant::now();
        let url = probe_url(&route.target, &self.config.path);

        let result = timeout(self.config.timeout(), self.client.get(url.as_str()).send()).await;

        let (healthy, error) = match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    (true, None)
                } else {
                    (false, Some(format!("HTTP {}", status)))
                }
            }
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("probe timed out".to_string())),
        };

        let response_time_ms = start.elapsed().as_millis() as u64;

        let transition = if healthy {
            self.table.record_success(index)
        } else {
            self.table.record_failure(index)
        };

        let now_healthy = self.table.is_healthy(index);
        if let Some(metrics) = &self.metrics {
            metrics.update_upstream_health(&route.prefix, now_healthy);
        }

        match transition {
            Transition::BecameHealthy => {
                info!(prefix = %route.prefix, upstream = %route.target, "Upstream is healthy again");
            }
            Transition::BecameUnhealthy => {
                warn!(
                    prefix = %route.prefix,
                    upstream = %route.target,
                    failures = self.table.unhealthy_threshold(),
                    "Upstream marked unhealthy"
                );
            }
            Transition::Unchanged => {}
        }

        if let Some(error) = &error {
            warn!(
                prefix = %route.prefix,
                upstream = %route.target,
                elapsed_ms = response_time_ms,
                %error,
                "Health probe failed"
            );
        }

        ProbeResult {
            prefix: route.prefix.clone(),
            healthy,
            response_time_ms,
            error,
        }
    }
}

/// Probe path appended to the upstream's own base path.
pub fn probe_url(target: &Url, path: &str) -> Url {
    let mut url = target.clone();
    let joined = crate::routing::join_paths(target.path(), path);
    url.set_path(&joined);
    url.set_query(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn checker_for(targets: &[&str], threshold: u32) -> (Arc<HealthChecker>, Arc<HealthTable>) {
        let registry = Arc::new(UpstreamRegistry::new(
            targets
                .iter()
                .enumerate()
                .map(|(i, t)| Route::new(&format!("/svc{}", i), Url::parse(t).unwrap()))
                .collect(),
        ));
        let table = Arc::new(HealthTable::new(&registry, threshold));
        let config = HealthCheckConfig {
            interval_secs: 1,
            timeout_ms: 300,
            path: "/health".to_string(),
            unhealthy_threshold: threshold,
        };
        let checker = HealthChecker::new(config, registry, table.clone(), None).unwrap();
        (Arc::new(checker), table)
    }

    #[test]
    fn probe_url_keeps_base_path() {
        let url = Url::parse("http://u1:3001/api/?q=1").unwrap();
        assert_eq!(probe_url(&url, "/health").as_str(), "http://u1:3001/api/health");

        let url = Url::parse("http://u1").unwrap();
        assert_eq!(probe_url(&url, "/health").as_str(), "http://u1/health");
    }

    #[tokio::test]
    async fn failing_probes_mark_upstream_down_then_one_success_recovers() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/health")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let url = server.url();
        let (checker, table) = checker_for(&[url.as_str()], 3);

        for _ in 0..2 {
            checker.run_once().await;
            assert!(table.is_healthy(0));
        }
        let results = checker.run_once().await;
        assert!(!results[0].healthy);
        assert_eq!(results[0].error.as_deref(), Some("HTTP 500 Internal Server Error"));
        assert!(!table.is_healthy(0));
        failing.assert_async().await;
        failing.remove_async().await;

        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let results = checker.run_once().await;
        assert!(results[0].healthy);
        assert!(table.is_healthy(0));
    }

    #[tokio::test]
    async fn unreachable_upstream_counts_as_failure() {
        // Nothing listens on the discard port on loopback.
        let (checker, table) = checker_for(&["http://127.0.0.1:9"], 1);

        let results = checker.run_once().await;
        assert!(!results[0].healthy);
        assert!(results[0].error.is_some());
        assert!(!table.is_healthy(0));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (checker, _table) = checker_for(&["http://127.0.0.1:9"], 3);
        let handle = tokio::spawn(checker.clone().start());

        checker.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("prober did not stop")
            .unwrap();
    }
}
