// src/health/status.rs
use crate::routing::UpstreamRegistry;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Point-in-time health of one route's upstream. Instances are immutable;
/// the table swaps in a new one per probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamStatus {
    pub prefix: String,
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    BecameHealthy,
    BecameUnhealthy,
}

impl UpstreamStatus {
    fn after_probe(&self, success: bool, threshold: u32, at: DateTime<Utc>) -> Self {
        if success {
            return Self {
                prefix: self.prefix.clone(),
                healthy: true,
                last_checked: Some(at),
                consecutive_failures: 0,
            };
        }

        let failures = self.consecutive_failures.saturating_add(1);
        Self {
            prefix: self.prefix.clone(),
            healthy: self.healthy && failures < threshold,
            last_checked: Some(at),
            consecutive_failures: failures,
        }
    }
}

/// Health of every registered upstream, indexed like the registry.
///
/// Written by the prober only; readers never block and may observe a
/// status one probe behind.
pub struct HealthTable {
    statuses: Vec<ArcSwap<UpstreamStatus>>,
    unhealthy_threshold: u32,
}

impl HealthTable {
    /// Every upstream starts healthy so traffic flows before the first probe.
    pub fn new(registry: &UpstreamRegistry, unhealthy_threshold: u32) -> Self {
        let statuses = registry
            .routes()
            .iter()
            .map(|route| {
                ArcSwap::from_pointee(UpstreamStatus {
                    prefix: route.prefix.clone(),
                    healthy: true,
                    last_checked: None,
                    consecutive_failures: 0,
                })
            })
            .collect();

        Self {
            statuses,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub fn unhealthy_threshold(&self) -> u32 {
        self.unhealthy_threshold
    }

    pub fn status(&self, index: usize) -> Option<Arc<UpstreamStatus>> {
        self.statuses.get(index).map(|slot| slot.load_full())
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        self.statuses
            .get(index)
            .map(|slot| slot.load().healthy)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<Arc<UpstreamStatus>> {
        self.statuses.iter().map(|slot| slot.load_full()).collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.statuses.iter().filter(|slot| slot.load().healthy).count()
    }

    pub fn record_success(&self, index: usize) -> Transition {
        self.record(index, true)
    }

    pub fn record_failure(&self, index: usize) -> Transition {
        self.record(index, false)
    }

    fn record(&self, index: usize, success: bool) -> Transition {
        let Some(slot) = self.statuses.get(index) else {
            return Transition::Unchanged;
        };

        let now = Utc::now();
        let threshold = self.unhealthy_threshold;
        let previous = slot.rcu(|current| current.after_probe(success, threshold, now));
        let next = previous.after_probe(success, threshold, now);

        match (previous.healthy, next.healthy) {
            (false, true) => Transition::BecameHealthy,
            (true, false) => Transition::BecameUnhealthy,
            _ => Transition::Unchanged,
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            upstreams: self
                .snapshot()
                .iter()
                .map(|status| UpstreamHealth {
                    prefix: status.prefix.clone(),
                    healthy: status.healthy,
                })
                .collect(),
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub upstreams: Vec<UpstreamHealth>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamHealth {
    pub prefix: String,
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Route;
    use url::Url;

    fn table(threshold: u32) -> HealthTable {
        let registry = UpstreamRegistry::new(vec![
            Route::new("/auth", Url::parse("http://u1").unwrap()),
            Route::new("/courses", Url::parse("http://u2").unwrap()),
        ]);
        HealthTable::new(&registry, threshold)
    }

    #[test]
    fn starts_healthy_and_unchecked() {
        let table = table(3);
        let status = table.status(0).unwrap();

        assert!(status.healthy);
        assert!(status.last_checked.is_none());
        assert_eq!(table.healthy_count(), 2);
        assert!(!table.is_healthy(7));
    }

    #[test]
    fn degrades_after_threshold_failures() {
        let table = table(3);

        assert_eq!(table.record_failure(0), Transition::Unchanged);
        assert_eq!(table.record_failure(0), Transition::Unchanged);
        assert!(table.is_healthy(0));

        assert_eq!(table.record_failure(0), Transition::BecameUnhealthy);
        assert!(!table.is_healthy(0));
        assert_eq!(table.status(0).unwrap().consecutive_failures, 3);

        assert_eq!(table.record_failure(0), Transition::Unchanged);
        assert!(table.is_healthy(1));
    }

    #[test]
    fn one_success_restores() {
        let table = table(3);
        for _ in 0..3 {
            table.record_failure(0);
        }

        assert_eq!(table.record_success(0), Transition::BecameHealthy);
        let status = table.status(0).unwrap();
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_checked.is_some());
    }

    #[test]
    fn success_resets_failure_streak() {
        let table = table(3);
        table.record_failure(0);
        table.record_failure(0);
        table.record_success(0);
        table.record_failure(0);
        table.record_failure(0);

        assert!(table.is_healthy(0));
    }

    #[test]
    fn report_serializes_prefix_and_health() {
        let table = table(1);
        table.record_failure(1);

        let json = serde_json::to_value(table.report()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "ok",
                "upstreams": [
                    {"prefix": "/auth", "healthy": true},
                    {"prefix": "/courses", "healthy": false},
                ]
            })
        );
    }
}
