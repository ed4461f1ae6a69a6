use crate::access;
use crate::app::AppState;
use crate::context::{normalize_host, resolve_client_ip, RequestContext};
use crate::control_plane::ConfigLookup;
use crate::events::{RequestEvent, SecurityEvent};
use crate::forward::ProxyTarget;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

/// Paths that bypass the WAF entirely: the gateway's own endpoints plus the
/// surfaces dashboards poll. No decision, no broadcast.
pub const SKIP_PATHS: [&str; 8] = [
    "/health",
    "/metrics",
    "/docs",
    "/redoc",
    "/ws",
    "/static/",
    "/verify-recaptcha",
    "/favicon.ico",
];

/// Largest request body the gateway buffers for scanning and forwarding.
const MAX_BUFFERED_BODY: usize = 10 * 1024 * 1024;

const DENIAL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>403 Forbidden</title>
<style>
body { font-family: sans-serif; background: #f4f4f5; color: #1f2937; text-align: center; padding-top: 10vh; }
.card { display: inline-block; background: #fff; border-radius: 8px; padding: 2rem 3rem; box-shadow: 0 1px 4px rgba(0,0,0,.12); }
h1 { color: #b91c1c; margin-bottom: .5rem; }
</style>
</head>
<body>
<div class="card">
<h1>Access Denied</h1>
<p>Your request was blocked by the Web Application Firewall.</p>
<p><strong>{reason}</strong></p>
</div>
</body>
</html>
"#;

const CHALLENGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Verification Required</title>
<script src="https://www.google.com/recaptcha/api.js" async defer></script>
<style>
body { font-family: sans-serif; background: #f4f4f5; color: #1f2937; text-align: center; padding-top: 10vh; }
.card { display: inline-block; background: #fff; border-radius: 8px; padding: 2rem 3rem; box-shadow: 0 1px 4px rgba(0,0,0,.12); }
</style>
</head>
<body>
<div class="card">
<h1>Verification Required</h1>
<p>reCAPTCHA required before this request can continue.</p>
<div class="g-recaptcha" data-sitekey="{site_key}" data-callback="onSolved"></div>
</div>
<script>
function onSolved(token) {
  fetch('/verify-recaptcha', {
    method: 'POST',
    headers: { 'Content-Type': 'application/json' },
    body: JSON.stringify({ token: token, ip: '{client_ip}' })
  }).then(function (resp) { if (resp.ok) { location.reload(); } });
}
</script>
</body>
</html>
"#;

pub fn should_skip(path: &str) -> bool {
    SKIP_PATHS.iter().any(|prefix| path.starts_with(prefix))
}

fn challenge_page(site_key: &str, client_ip: std::net::IpAddr) -> Response {
    let body = CHALLENGE_TEMPLATE
        .replace("{site_key}", site_key)
        .replace("{client_ip}", &client_ip.to_string());
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

fn denial_page(reason: &str) -> Response {
    let body = DENIAL_TEMPLATE.replace("{reason}", &escape_html(reason));
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Per-request WAF pipeline: resolve client IP and host, load the tenant
/// config, run access controls and the rule engine, then either render the
/// denial page or hand the request on for forwarding. Telemetry and
/// security-event emission run as detached tasks, never on this path.
pub async fn waf_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if should_skip(&path) {
        return next.run(req).await;
    }

    let host = normalize_host(
        req.headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default(),
    );
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let client_ip = resolve_client_ip(req.headers(), peer);
    debug!(method = %req.method(), path, client_ip = %client_ip, host, "Processing request");

    let tenant = match state.control_plane.get_tenant_config(&host).await {
        ConfigLookup::Found(tenant) => tenant,
        ConfigLookup::NotConfigured => {
            warn!(host, "No WAF configuration found");
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
    };

    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let body_bytes = match to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(client_ip = %client_ip, host, error = %err, "Failed to read request body, treating as empty");
            bytes::Bytes::new()
        }
    };
    let ctx = RequestContext::new(&parts, &body_bytes, client_ip);

    let mut decision = access::check_ip_blacklist(client_ip, &tenant);
    if !decision.blocked {
        decision = access::check_country(client_ip, &tenant, &state.control_plane).await;
    }
    if !decision.blocked {
        decision = state.engine.check(&ctx, &tenant).await;
    }

    state
        .metrics
        .record_decision(decision.blocked, started.elapsed().as_secs_f64());

    let event = RequestEvent::from_decision(&ctx, &tenant, &decision);
    let hub = state.hub.clone();
    tokio::spawn(async move {
        hub.publish(event).await;
    });

    if decision.blocked {
        let reason = decision
            .reason
            .clone()
            .unwrap_or_else(|| "Request blocked".to_string());
        state
            .metrics
            .record_blocked(decision.threat.unwrap_or("Unknown"));
        warn!(client_ip = %client_ip, host, reason, "Request blocked");

        let control_plane = state.control_plane.clone();
        let mut security_event = SecurityEvent {
            client_host: host,
            ip_address: client_ip.to_string(),
            country_code: String::new(),
            request_path: ctx.path.clone(),
            user_agent: ctx.user_agent.clone(),
            reason: reason.clone(),
            method: ctx.method.to_string(),
            blocked: true,
        };
        tokio::spawn(async move {
            if let Some(geo) = control_plane.get_ip_geolocation(client_ip).await {
                security_event.country_code = geo.country_code.unwrap_or_default();
            }
            control_plane.log_security_event(&security_event).await;
        });

        // the recaptcha rule only flags the request; the challenge itself is
        // rendered here
        if reason == "reCAPTCHA required" {
            return challenge_page(&state.config.recaptcha_site_key, client_ip);
        }
        return denial_page(&reason);
    }

    let mut req = Request::from_parts(parts, Body::from(body_bytes));
    req.extensions_mut().insert(ProxyTarget {
        tenant: tenant.clone(),
        client_ip,
    });
    next.run(req).await
}
