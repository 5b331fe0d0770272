// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::listener::{bind_tcp, tune_stream};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use hyper::server::conn::Http;
use hyper::{Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::Service;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// A handler that is specialised per accepted connection, e.g. to learn
/// the client address for `X-Forwarded-For`.
pub trait PeerService: Clone {
    fn for_peer(&self, peer: SocketAddr) -> Self;
}

/// Builder pattern so `main.rs` can inject its handler and shutdown signal.
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + PeerService + Send + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
    shutdown: Option<BoxFuture<'static, ()>>,
    grace_period: Duration,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + PeerService + Send + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: None,
            shutdown: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Stop accepting connections once `signal` resolves, then let open
    /// connections finish their current exchange.
    pub fn with_shutdown<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    /// How long in-flight exchanges may run after shutdown before they
    /// are cut off.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self) -> Result<()> {
        let listener = bind_tcp(self.addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener; one Tokio task per connection,
    /// HTTP/1.1 or HTTP/2 with prior knowledge.
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        let handler = self
            .handler
            .context("handler must be set via with_handler()")?;
        let mut shutdown: BoxFuture<'static, ()> = match self.shutdown {
            Some(signal) => signal,
            None => Box::pin(std::future::pending()),
        };

        let (drain_tx, drain_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        tracing::info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    tune_stream(&stream);
                    let svc = handler.for_peer(peer);
                    let mut drain = drain_rx.clone();

                    connections.spawn(async move {
                        let conn = Http::new().serve_connection(stream, svc);
                        tokio::pin!(conn);
                        let mut draining = false;

                        loop {
                            tokio::select! {
                                served = conn.as_mut() => {
                                    if let Err(err) = served {
                                        tracing::debug!(%peer, %err, "connection error");
                                    }
                                    break;
                                }
                                _ = drain.changed(), if !draining => {
                                    draining = true;
                                    conn.as_mut().graceful_shutdown();
                                }
                            }
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    tracing::info!("No longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        let _ = drain_tx.send(true);

        let open = connections.len();
        if open > 0 {
            tracing::info!(open, "Waiting for open connections to finish");
        }
        let drained = tokio::time::timeout(self.grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "Grace period elapsed, closing remaining connections"
            );
            connections.shutdown().await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    /// Records the peer each connection was specialised for.
    #[derive(Clone)]
    struct PeerEcho {
        peers: Arc<Mutex<Vec<SocketAddr>>>,
        peer: Option<SocketAddr>,
    }

    impl PeerService for PeerEcho {
        fn for_peer(&self, peer: SocketAddr) -> Self {
            self.peers.lock().unwrap().push(peer);
            Self {
                peers: self.peers.clone(),
                peer: Some(peer),
            }
        }
    }

    impl Service<Request<Body>> for PeerEcho {
        type Response = Response<Body>;
        type Error = Infallible;
        type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Infallible>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            let peer = self.peer;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Response::new(Body::from(format!("{:?}", peer))))
            })
        }
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_exchanges_finish() {
        let peers = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(
            ServerBuilder::new(addr)
                .with_handler(PeerEcho {
                    peers: peers.clone(),
                    peer: None,
                })
                .with_shutdown(async {
                    let _ = stop_rx.await;
                })
                .serve_on(listener),
        );

        let uri: hyper::Uri = format!("http://{}/", addr).parse().unwrap();
        let request = tokio::spawn(async move { hyper::Client::new().get(uri).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(()).unwrap();

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.status(), hyper::StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let peer = peers.lock().unwrap()[0];
        assert_eq!(body, format!("{:?}", Some(peer)));

        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server did not stop after draining")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn grace_period_bounds_the_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(
            ServerBuilder::new(addr)
                .with_handler(PeerEcho {
                    peers: Arc::new(Mutex::new(Vec::new())),
                    peer: None,
                })
                .with_shutdown(async {
                    let _ = stop_rx.await;
                })
                .with_grace_period(Duration::from_millis(50))
                .serve_on(listener),
        );

        let uri: hyper::Uri = format!("http://{}/", addr).parse().unwrap();
        let request = tokio::spawn(async move { hyper::Client::new().get(uri).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_millis(250), server)
            .await
            .expect("drain was not bounded by the grace period")
            .unwrap()
            .unwrap();
        assert!(request.await.unwrap().is_err());
    }
}
