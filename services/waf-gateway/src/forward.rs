use crate::app::AppState;
use crate::context::normalize_host;
use crate::control_plane::ConfigLookup;
use crate::tenant::TenantConfig;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Stashed by the WAF layer on allowed requests so the fallback route knows
/// where to send them.
#[derive(Clone)]
pub struct ProxyTarget {
    pub tenant: Arc<TenantConfig>,
    pub client_ip: IpAddr,
}

const MAX_BUFFERED_BODY: usize = 10 * 1024 * 1024;

/// Fallback route: everything that is not one of the gateway's own endpoints
/// gets forwarded to the tenant origin. Requests arriving without a
/// `ProxyTarget` are skip-listed paths, forwarded without inspection.
pub async fn proxy_passthrough(State(state): State<AppState>, req: Request) -> Response {
    let tenant = match req.extensions().get::<ProxyTarget>() {
        Some(target) => target.tenant.clone(),
        None => {
            let host = normalize_host(
                req.headers()
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default(),
            );
            match state.control_plane.get_tenant_config(&host).await {
                ConfigLookup::Found(tenant) => tenant,
                ConfigLookup::NotConfigured => {
                    return (
                        StatusCode::NOT_FOUND,
                        Json(json!({
                            "error": "Service not configured",
                            "detail": format!("No WAF configuration found for {host}"),
                        })),
                    )
                        .into_response();
                }
                ConfigLookup::Unavailable => {
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(json!({
                            "error": "Service temporarily unavailable",
                            "detail": "Configuration could not be loaded",
                        })),
                    )
                        .into_response();
                }
            }
        }
    };
    forward(&state, &tenant, req).await
}

/// Forward a request to the tenant origin and stream the response back.
/// Hop-by-hop headers are stripped in both directions; the HTTP client sets
/// `host` and `content-length` itself.
pub async fn forward(state: &AppState, tenant: &TenantConfig, req: Request) -> Response {
    let mut url = format!(
        "{}{}",
        tenant.target_url.trim_end_matches('/'),
        req.uri().path()
    );
    if let Some(query) = req.uri().query() {
        url.push('?');
        url.push_str(query);
    }

    let method = req.method().clone();
    let mut headers = req.headers().clone();
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let body_bytes = match to_bytes(req.into_body(), MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "Failed to buffer request body for forwarding");
            bytes::Bytes::new()
        }
    };

    debug!(method = %method, %url, "Forwarding request upstream");
    let started = Instant::now();
    let mut builder = state
        .http_client
        .request(method.clone(), &url)
        .headers(headers)
        .timeout(Duration::from_secs(state.config.upstream_timeout_secs));
    if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        builder = builder.body(body_bytes);
    }

    match builder.send().await {
        Ok(upstream) => {
            state.metrics.observe_upstream(started.elapsed().as_secs_f64());
            let status = upstream.status();
            let headers = filter_response_headers(upstream.headers());
            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(err) if err.is_connect() => {
            warn!(%url, error = %err, "Upstream unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, "Upstream unavailable").into_response()
        }
        Err(err) => {
            warn!(%url, error = %err, "Upstream request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Upstream request failed").into_response()
        }
    }
}

fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    headers
}
