// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(%err, "Failed to encode metrics");
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,

    // Upstream metrics
    pub upstream_inflight: IntGaugeVec,
    pub upstream_health_status: IntGaugeVec,
    pub pool_exhausted_total: IntCounterVec,

    // Gateway-wide
    pub healthy_upstreams: IntGauge,
    pub total_upstreams: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["method", "status_code", "route"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Time to response head in seconds",
            ),
            &["route"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let upstream_inflight = IntGaugeVec::new(
            Opts::new(
                "gateway_upstream_inflight",
                "Requests currently holding an upstream connection",
            ),
            &["upstream"],
        )?;
        registry.register(Box::new(upstream_inflight.clone()))?;

        let upstream_health_status = IntGaugeVec::new(
            Opts::new(
                "gateway_upstream_health_status",
                "Upstream health status (1=healthy, 0=unhealthy)",
            ),
            &["route"],
        )?;
        registry.register(Box::new(upstream_health_status.clone()))?;

        let pool_exhausted_total = IntCounterVec::new(
            Opts::new(
                "gateway_pool_exhausted_total",
                "Requests rejected because the upstream's in-flight cap was reached",
            ),
            &["upstream"],
        )?;
        registry.register(Box::new(pool_exhausted_total.clone()))?;

        let healthy_upstreams =
            IntGauge::new("gateway_healthy_upstreams", "Number of healthy upstreams")?;
        registry.register(Box::new(healthy_upstreams.clone()))?;

        let total_upstreams =
            IntGauge::new("gateway_total_upstreams", "Total number of upstreams")?;
        registry.register(Box::new(total_upstreams.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            upstream_inflight,
            upstream_health_status,
            pool_exhausted_total,
            healthy_upstreams,
            total_upstreams,
        })
    }

    pub fn record_request(
        &self,
        method: &str,
        status_code: u16,
        route: &str,
        duration: std::time::Duration,
    ) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status, route])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    pub fn upstream_inflight(&self, upstream: &str) -> IntGauge {
        self.upstream_inflight.with_label_values(&[upstream])
    }

    pub fn record_pool_exhausted(&self, upstream: &str) {
        self.pool_exhausted_total
            .with_label_values(&[upstream])
            .inc();
    }

    pub fn update_upstream_health(&self, route: &str, healthy: bool) {
        let value = if healthy { 1 } else { 0 };
        self.upstream_health_status
            .with_label_values(&[route])
            .set(value);
    }

    pub fn update_upstream_counts(&self, healthy: usize, total: usize) {
        self.healthy_upstreams.set(healthy as i64);
        self.total_upstreams.set(total as i64);
    }
}

// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_recorded_series() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        metrics.record_request("GET", 200, "/auth", std::time::Duration::from_millis(5));
        metrics.update_upstream_health("/auth", false);
        metrics.record_pool_exhausted("http://u1:80");
        metrics.upstream_inflight("http://u1:80").inc();

        let text = String::from_utf8(registry.gather()).unwrap();
        assert!(text.contains(r#"gateway_requests_total{method="GET",route="/auth",status_code="200"} 1"#));
        assert!(text.contains(r#"gateway_upstream_health_status{route="/auth"} 0"#));
        assert!(text.contains(r#"gateway_pool_exhausted_total{upstream="http://u1:80"} 1"#));
        assert!(text.contains(r#"gateway_upstream_inflight{upstream="http://u1:80"} 1"#));
    }
}
