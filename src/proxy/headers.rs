// src/proxy/headers.rs
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use std::net::IpAddr;
use url::Url;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single transport leg (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Remove hop-by-hop headers, including any nominated by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Point `Host` at the upstream so virtual-hosted backends see their own name.
pub fn set_upstream_host(headers: &mut HeaderMap, target: &Url) {
    let host = match (target.host_str(), target.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return,
    };
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(HOST, value);
    }
}

/// Append the client to `X-Forwarded-For` and record the original host
/// and scheme.
pub fn append_forwarded(
    headers: &mut HeaderMap,
    peer: Option<IpAddr>,
    original_host: Option<&HeaderValue>,
    scheme: &str,
) {
    if let Some(ip) = peer {
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, ip),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = original_host {
        if !headers.contains_key(X_FORWARDED_HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        if let Ok(value) = HeaderValue::from_str(scheme) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
    }
}

/// Reuse the caller's request id or mint a new one.
pub fn ensure_request_id(headers: &mut HeaderMap) -> HeaderValue {
    if let Some(existing) = headers.get(X_REQUEST_ID) {
        return existing.clone();
    }

    let id = uuid::Uuid::new_v4().to_string();
    let value = HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    headers.insert(X_REQUEST_ID, value.clone());
    value
}
