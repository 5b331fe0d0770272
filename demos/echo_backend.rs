//! demos/echo_backend.rs
//! Run: cargo run --example echo_backend -- <port> [name]
//!
//! Echoes method, URI, headers and body back as JSON. `/health` answers
//! 200 until `/toggle-health` is requested, then 503 until toggled again.

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Clone)]
struct BackendState {
    name:         String,
    req_counter:  Arc<AtomicU64>,
    healthy_flag: Arc<AtomicBool>,
}

async fn handle(
    req: Request<Body>,
    state: BackendState,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_owned();

    match path.as_str() {
        "/health" => {
            let status = if state.healthy_flag.load(Ordering::SeqCst) {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let mut response = Response::new(Body::from(status.to_string()));
            *response.status_mut() = status;
            return Ok(response);
        }
        "/toggle-health" => {
            let was = state.healthy_flag.fetch_xor(true, Ordering::SeqCst);
            println!("[{}] health toggled: {} -> {}", state.name, was, !was);
            return Ok(Response::new(Body::from(format!("healthy={}\n", !was))));
        }
        _ => {}
    }

    let n = state.req_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                serde_json::Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
            )
        })
        .collect();

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => format!("<body error: {}>", err),
    };

    println!("[{}] #{} {} {}", state.name, n, method, uri);

    let payload = serde_json::json!({
        "backend": state.name,
        "request": n,
        "method": method,
        "uri": uri,
        "headers": headers,
        "body": body,
    });

    let mut response = Response::new(Body::from(payload.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001);
    let name = args.next().unwrap_or_else(|| format!("echo-{}", port));

    let state = BackendState {
        name,
        req_counter:  Arc::new(AtomicU64::new(0)),
        healthy_flag: Arc::new(AtomicBool::new(true)),
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(req, state.clone())))
        }
    });

    println!("echo backend listening on http://{}", addr);
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        eprintln!("server error: {}", e);
    }
}
