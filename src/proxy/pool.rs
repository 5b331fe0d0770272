// src/proxy/pool.rs
use crate::config::PoolConfig;
use crate::metrics::MetricsCollector;
use crate::routing::{upstream_key, Route};
use dashmap::DashMap;
use hyper::client::conn::{self, SendRequest};
use hyper::client::HttpConnector;
use hyper::{Body, Request, Response, Uri};
use hyper_tls::HttpsConnector;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, trace};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{upstream} has {limit} requests in flight")]
    Exhausted { upstream: String, limit: usize },

    #[error("failed to connect to {upstream}: {reason}")]
    Connect { upstream: String, reason: String },

    #[error("invalid upstream address {0}")]
    InvalidUpstream(String),

    #[error("connection already returned to the pool")]
    Released,

    #[error(transparent)]
    Send(#[from] hyper::Error),
}

struct Live {
    sender: SendRequest<Body>,
    driver: JoinHandle<()>,
}

impl Live {
    /// Non-blocking: a sender still waiting on its previous exchange reports
    /// `Pending` and counts as open. Only a dead connection errors.
    fn is_closed(&mut self) -> bool {
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        matches!(self.sender.poll_ready(&mut cx), Poll::Ready(Err(_)))
    }

    fn discard(self) {
        self.driver.abort();
    }
}

struct IdleConnection {
    live: Live,
    last_used: Instant,
}

/// Idle connections and the in-flight budget for one upstream. Each
/// upstream has its own lock so unrelated traffic never contends.
struct UpstreamSlot {
    key: String,
    idle: Mutex<VecDeque<IdleConnection>>,
    inflight: Arc<Semaphore>,
    max_idle: usize,
    idle_timeout: Duration,
}

impl UpstreamSlot {
    /// Most recently used first; anything past the idle timeout or already
    /// closed is dropped on the way.
    fn take_idle(&self) -> Option<Live> {
        let mut expired = Vec::new();
        let found = {
            let mut idle = match self.idle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            while let Some(front) = idle.front() {
                if front.last_used.elapsed() < self.idle_timeout {
                    break;
                }
                if let Some(stale) = idle.pop_front() {
                    expired.push(stale.live);
                }
            }

            let mut found = None;
            while let Some(mut candidate) = idle.pop_back() {
                if candidate.live.is_closed() {
                    expired.push(candidate.live);
                    continue;
                }
                found = Some(candidate.live);
                break;
            }
            found
        };

        for live in expired {
            live.discard();
        }
        found
    }

    fn put_idle(&self, live: Live) {
        if self.max_idle == 0 {
            live.discard();
            return;
        }

        let mut evicted = Vec::new();
        {
            let mut idle = match self.idle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            idle.push_back(IdleConnection {
                live,
                last_used: Instant::now(),
            });
            while idle.len() > self.max_idle {
                if let Some(oldest) = idle.pop_front() {
                    evicted.push(oldest.live);
                }
            }
        }

        if !evicted.is_empty() {
            trace!(upstream = %self.key, evicted = evicted.len(), "Idle cap reached");
        }
        for live in evicted {
            live.discard();
        }
    }

    fn evict_expired(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut idle = match self.idle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let parked: Vec<IdleConnection> = idle.drain(..).collect();
            for mut conn in parked {
                if conn.last_used.elapsed() < self.idle_timeout && !conn.live.is_closed() {
                    idle.push_back(conn);
                } else {
                    expired.push(conn.live);
                }
            }
        }

        let count = expired.len();
        for live in expired {
            live.discard();
        }
        count
    }

    fn idle_len(&self) -> usize {
        match self.idle.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Reusable HTTP/1.1 connections keyed by upstream `scheme://host:port`.
pub struct ConnectionPool {
    upstreams: DashMap<String, Arc<UpstreamSlot>>,
    config: PoolConfig,
    connector: HttpsConnector<HttpConnector>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        Self {
            upstreams: DashMap::new(),
            config,
            connector: HttpsConnector::new_with_connector(http),
            metrics,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slot(&self, key: &str) -> Arc<UpstreamSlot> {
        if let Some(slot) = self.upstreams.get(key) {
            return slot.clone();
        }

        self.upstreams
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(UpstreamSlot {
                    key: key.to_string(),
                    idle: Mutex::new(VecDeque::new()),
                    inflight: Arc::new(Semaphore::new(self.config.max_connections)),
                    max_idle: self.config.max_idle,
                    idle_timeout: self.config.idle_timeout(),
                })
            })
            .clone()
    }

    /// Hand out a ready connection to the route's upstream, reusing an idle
    /// one when possible. Fails immediately once `max_connections` requests
    /// to that upstream are in flight.
    pub async fn acquire(&self, route: &Route) -> Result<PooledConnection, PoolError> {
        let key = route.upstream_key();
        let slot = self.slot(&key);

        let permit = slot.inflight.clone().try_acquire_owned().map_err(|_| {
            if let Some(metrics) = &self.metrics {
                metrics.record_pool_exhausted(&key);
            }
            PoolError::Exhausted {
                upstream: key.clone(),
                limit: self.config.max_connections,
            }
        })?;

        let live = loop {
            match slot.take_idle() {
                Some(mut live) => {
                    if futures::future::poll_fn(|cx| live.sender.poll_ready(cx))
                        .await
                        .is_ok()
                    {
                        trace!(upstream = %key, "Reusing idle connection");
                        break live;
                    }
                    live.discard();
                }
                None => break self.connect(route, &key).await?,
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.upstream_inflight(&key).inc();
        }

        Ok(PooledConnection {
            slot,
            live: Some(live),
            metrics: self.metrics.clone(),
            _permit: permit,
        })
    }

    /// Return a connection whose exchange finished cleanly.
    pub fn release(&self, connection: PooledConnection) {
        connection.release();
    }

    async fn connect(&self, route: &Route, key: &str) -> Result<Live, PoolError> {
        let uri: Uri = route
            .target
            .as_str()
            .parse()
            .map_err(|_| PoolError::InvalidUpstream(route.target.to_string()))?;

        let stream = self
            .connector
            .clone()
            .oneshot(uri)
            .await
            .map_err(|e| PoolError::Connect {
                upstream: key.to_string(),
                reason: e.to_string(),
            })?;

        let (mut sender, connection) = conn::handshake(stream).await?;

        let upstream = key.to_string();
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(%upstream, %err, "Upstream connection closed with error");
            }
        });

        if let Err(err) = futures::future::poll_fn(|cx| sender.poll_ready(cx)).await {
            driver.abort();
            return Err(err.into());
        }

        debug!(upstream = %key, "Opened upstream connection");
        Ok(Live { sender, driver })
    }

    /// Drop idle connections past their timeout across all upstreams.
    pub fn evict_expired(&self) -> usize {
        self.upstreams
            .iter()
            .map(|entry| entry.value().evict_expired())
            .sum()
    }

    /// Periodically evicts expired idle connections until aborted.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let every = (self.config.idle_timeout() / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = pool.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "Evicted idle upstream connections");
                }
            }
        })
    }

    pub fn idle_count(&self, route: &Route) -> usize {
        self.upstreams
            .get(&route.upstream_key())
            .map(|slot| slot.idle_len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self, route: &Route) -> usize {
        self.upstreams
            .get(&upstream_key(&route.target))
            .map(|slot| self.config.max_connections - slot.inflight.available_permits())
            .unwrap_or(0)
    }
}

/// A checked-out connection plus its slot in the upstream's in-flight
/// budget. Dropping it without `release` closes the socket.
pub struct PooledConnection {
    slot: Arc<UpstreamSlot>,
    live: Option<Live>,
    metrics: Option<Arc<MetricsCollector>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn upstream(&self) -> &str {
        &self.slot.key
    }

    pub async fn send(&mut self, request: Request<Body>) -> Result<Response<Body>, PoolError> {
        let live = self.live.as_mut().ok_or(PoolError::Released)?;
        Ok(live.sender.send_request(request).await?)
    }

    /// Park the connection for reuse, unless the upstream already closed it.
    pub fn release(mut self) {
        if let Some(mut live) = self.live.take() {
            if live.is_closed() {
                live.discard();
            } else {
                self.slot.put_idle(live);
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            trace!(upstream = %self.slot.key, "Discarding unreleased connection");
            live.discard();
        }
        if let Some(metrics) = &self.metrics {
            metrics.upstream_inflight(&self.slot.key).dec();
        }
    }
}
