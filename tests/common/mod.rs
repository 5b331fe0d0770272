// tests/common/mod.rs
#![allow(dead_code)]

use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prefix_gateway::config::{
    Config, CorsConfig, HealthCheckConfig, MetricsConfig, PoolConfig, RouteConfig,
};
use prefix_gateway::server::ServerBuilder;
use prefix_gateway::Gateway;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// In-process upstream that echoes what it received as JSON.
///
/// - `/health` answers 200 or 503 depending on `healthy`
/// - `/slow` waits a second before answering
/// - `/broken` sends one chunk and then aborts the body
/// - `/stall` sends one chunk and then goes quiet for ten seconds
pub struct EchoUpstream {
    pub addr: SocketAddr,
    pub healthy: Arc<AtomicBool>,
    pub hits: Arc<AtomicUsize>,
    /// Accepted TCP connections.
    pub connections: Arc<AtomicUsize>,
}

impl EchoUpstream {
    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

pub async fn spawn_echo_upstream(name: &'static str) -> EchoUpstream {
    let healthy = Arc::new(AtomicBool::new(true));
    let hits = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));

    let svc_healthy = healthy.clone();
    let svc_hits = hits.clone();
    let svc_connections = connections.clone();
    let make_svc = make_service_fn(move |_| {
        svc_connections.fetch_add(1, Ordering::SeqCst);
        let healthy = svc_healthy.clone();
        let hits = svc_hits.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                echo(req, name, healthy.clone(), hits.clone())
            }))
        }
    });

    let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);

    EchoUpstream {
        addr,
        healthy,
        hits,
        connections,
    }
}

async fn echo(
    req: Request<Body>,
    name: &'static str,
    healthy: Arc<AtomicBool>,
    hits: Arc<AtomicUsize>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();

    if path == "/health" {
        let status = if healthy.load(Ordering::SeqCst) {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        return Ok(Response::builder().status(status).body(Body::empty()).unwrap());
    }

    hits.fetch_add(1, Ordering::SeqCst);

    if path == "/slow" {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    if path == "/broken" {
        let (mut sender, body) = Body::channel();
        tokio::spawn(async move {
            let _ = sender.send_data(Bytes::from_static(b"partial")).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender.abort();
        });
        return Ok(Response::new(body));
    }

    if path == "/stall" {
        let (mut sender, body) = Body::channel();
        tokio::spawn(async move {
            let _ = sender.send_data(Bytes::from_static(b"head")).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(sender);
        });
        return Ok(Response::new(body));
    }

    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                serde_json::Value::String(v.to_str().unwrap_or("").to_string()),
            )
        })
        .collect();
    let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();

    let payload = serde_json::json!({
        "upstream": name,
        "method": method,
        "uri": uri,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("x-upstream", name)
        .header("connection", "x-upstream-private")
        .header("x-upstream-private", "secret")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap())
}

pub fn route(prefix: &str, target: Url) -> RouteConfig {
    RouteConfig {
        prefix: prefix.to_string(),
        target,
        strip_prefix: true,
        rewrite_to: None,
    }
}

pub fn config(routes: Vec<RouteConfig>) -> Config {
    Config {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        routes,
        request_timeout_ms: 5_000,
        shutdown_grace_secs: 5,
        health_check: HealthCheckConfig {
            interval_secs: 60,
            timeout_ms: 500,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
        },
        pool: PoolConfig::default(),
        cors: CorsConfig::default(),
        metrics: MetricsConfig::default(),
    }
}

/// Serve a gateway on an ephemeral port. Background probing is left off so
/// tests drive `checker.run_once()` themselves.
pub async fn spawn_gateway(config: Config) -> (SocketAddr, Arc<Gateway>) {
    config.validate().unwrap();
    let gateway = Arc::new(Gateway::new(&config, None).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = gateway.handler.clone();
    tokio::spawn(async move {
        let _ = ServerBuilder::new(addr)
            .with_handler(handler)
            .serve_on(listener)
            .await;
    });

    (addr, gateway)
}

/// Like `spawn_gateway`, but the server stops once the returned sender
/// fires; the handle resolves when it has finished draining.
pub async fn spawn_stoppable_gateway(
    config: Config,
) -> (
    SocketAddr,
    oneshot::Sender<()>,
    JoinHandle<anyhow::Result<()>>,
) {
    let gateway = Gateway::new(&config, None).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(
        ServerBuilder::new(addr)
            .with_handler(gateway.handler.clone())
            .with_shutdown(async {
                let _ = stop_rx.await;
            })
            .with_grace_period(config.shutdown_grace())
            .serve_on(listener),
    );

    (addr, stop_tx, server)
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
