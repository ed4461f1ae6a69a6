use axum::http::request::Parts;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;
use tracing::debug;

/// Proxy headers consulted for the real client address, most specific first.
pub const PROXY_IP_HEADERS: [&str; 9] = [
    "x-real-ip",
    "x-forwarded-for",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
    "x-cluster-client-ip",
    "proxy-client-ip",
    "true-client-ip",
    "cf-connecting-ip",
];

/// Largest slice of the request body that enters the scan surface.
pub const MAX_SCAN_BODY_BYTES: usize = 10 * 1024;

/// Immutable per-request view consumed by the decision pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub client_ip: IpAddr,
    pub user_agent: String,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(parts: &Parts, body: &Bytes, client_ip: IpAddr) -> Self {
        let headers: HashMap<String, String> = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let user_agent = headers.get("user-agent").cloned().unwrap_or_default();

        let body = if matches!(parts.method, Method::POST | Method::PUT | Method::PATCH) {
            let slice = &body[..body.len().min(MAX_SCAN_BODY_BYTES)];
            String::from_utf8_lossy(slice).into_owned()
        } else {
            String::new()
        };

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            body,
            headers,
            client_ip,
            user_agent,
            received_at: Instant::now(),
        }
    }
}

/// Resolve the client address: first syntactically valid IP found in the
/// proxy headers (first element of comma lists), else the transport peer.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> IpAddr {
    for name in PROXY_IP_HEADERS {
        let Some(raw) = headers.get(name).and_then(|value| value.to_str().ok()) else {
            continue;
        };
        let candidate = raw.split(',').next().unwrap_or_default().trim();
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            debug!(header = name, client_ip = %ip, "Resolved client IP from proxy header");
            return ip;
        }
    }
    peer.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Case-fold a host header value and strip any port suffix.
pub fn normalize_host(raw: &str) -> String {
    raw.split(':').next().unwrap_or_default().trim().to_lowercase()
}
