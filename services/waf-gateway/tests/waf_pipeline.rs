//! End-to-end pipeline tests: the router wired onto an in-memory KV store,
//! a mock control plane and a mock tenant origin.

mod support;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower::util::ServiceExt; // for oneshot
use waf_gateway::{router, KvStore, SubscriberKind};

const BODY_LIMIT: usize = 1 << 20;

fn mock_tenant_config<'a>(
    control_plane: &'a MockServer,
    host: &str,
    payload: serde_json::Value,
) -> httpmock::Mock<'a> {
    control_plane.mock(move |when, then| {
        when.method(GET)
            .path(format!("/clients/api/v1/clients/{host}/waf-config/"));
        then.status(200).json_body(payload.clone());
    })
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), BODY_LIMIT).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn encoded_sql_injection_is_denied_with_html() {
    let control_plane = MockServer::start();
    let rules = serde_json::json!([
        {"id": 5, "rule_type": "sql_injection", "value": "' OR '1'='1", "severity": "high", "is_active": true}
    ]);
    mock_tenant_config(&control_plane, "demo.local", support::tenant_payload("http://origin.invalid", rules));
    let security_events = control_plane.mock(|when, then| {
        when.method(POST).path("/logs/api/v1/security-events/");
        then.status(201);
    });

    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state.clone());

    let request = Request::builder()
        .uri("/login?user=admin%27%20OR%20%271%27%3D%271")
        .header("host", "demo.local")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(content_type, "text/html; charset=utf-8");
    let body = body_string(response).await;
    assert!(body.contains("SQL Injection pattern detected"));
    // the denial page never leaks the rule id
    assert!(!body.contains("\"rule_id\""));

    // fire-and-forget event lands shortly after the response
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(security_events.hits() >= 1);
}

#[tokio::test]
async fn clean_requests_are_forwarded_and_broadcast() {
    let control_plane = MockServer::start();
    let origin = MockServer::start();
    let upstream = origin.mock(|when, then| {
        when.method(POST)
            .path("/submit")
            .body(r#"{"comment":"hello"}"#);
        then.status(200).body("origin-ok");
    });
    let rules = serde_json::json!([
        {"rule_type": "sql_injection", "value": "' OR '1'='1"}
    ]);
    mock_tenant_config(&control_plane, "demo.local", support::tenant_payload(&origin.base_url(), rules));

    let (_kv, state) = support::state(&control_plane.base_url());
    let (tx, mut rx) = mpsc::channel(16);
    state.hub.register(SubscriberKind::Admin, tx).await;
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .header("host", "demo.local")
        .header("x-forwarded-for", "203.0.113.9")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"comment":"hello"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "origin-ok");
    upstream.assert_hits(1);

    let frame = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("hub channel closed");
    let axum::extract::ws::Message::Text(text) = frame else {
        panic!("unexpected frame");
    };
    let event: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(event["type"], "request_event");
    assert_eq!(event["waf_blocked"], false);
    assert_eq!(event["host"], "demo.local");
    assert_eq!(event["client_ip"], "203.0.113.9");
}

#[tokio::test]
async fn unconfigured_host_gets_404() {
    let control_plane = MockServer::start();
    control_plane.mock(|when, then| {
        when.method(GET)
            .path("/clients/api/v1/clients/ghost.local/waf-config/");
        then.status(404);
    });

    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let request = Request::builder()
        .uri("/anything")
        .header("host", "ghost.local")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_string(response).await;
    assert!(body.contains("Service not configured"));
    assert!(body.contains("ghost.local"));
}

#[tokio::test]
async fn control_plane_outage_yields_generic_503() {
    let control_plane = MockServer::start();
    control_plane.mock(|when, then| {
        when.method(GET)
            .path("/clients/api/v1/clients/demo.local/waf-config/");
        then.status(500);
    });

    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let request = Request::builder()
        .uri("/anything")
        .header("host", "demo.local")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn blacklisted_forwarded_ip_is_denied() {
    let control_plane = MockServer::start();
    let payload = serde_json::json!({
        "id": 7,
        "client_name": "Demo Shop",
        "client_host": "demo.local",
        "target_url": "http://origin.invalid",
        "enable_ip_blacklist": true,
        "ip_blacklist": ["10.0.0.0/24", "203.0.113.5"],
        "rules": [],
    });
    mock_tenant_config(&control_plane, "demo.local", payload);

    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let request = Request::builder()
        .uri("/")
        .header("host", "demo.local")
        .header("x-forwarded-for", "203.0.113.5, 198.51.100.2")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_string(response).await.contains("IP 203.0.113.5 is blacklisted"));

    let request = Request::builder()
        .uri("/")
        .header("host", "demo.local")
        .header("x-forwarded-for", "10.0.0.17")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_string(response).await.contains("10.0.0.0/24"));
}

#[tokio::test]
async fn skip_paths_bypass_the_waf_and_never_broadcast() {
    let control_plane = MockServer::start();
    let origin = MockServer::start();
    let docs = origin.mock(|when, then| {
        when.method(GET).path("/docs");
        then.status(200).body("docs-page");
    });
    // a rule that would block everything, to prove it is not consulted
    let rules = serde_json::json!([
        {"rule_type": "xss", "value": "docs"}
    ]);
    mock_tenant_config(&control_plane, "demo.local", support::tenant_payload(&origin.base_url(), rules));

    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state.clone());

    let request = Request::builder()
        .uri("/docs")
        .header("host", "demo.local")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "docs-page");
    docs.assert_hits(1);

    let stats = state.hub.global_stats().await;
    assert_eq!(stats.total_requests, 0, "skip paths must not enter telemetry");
}

#[tokio::test]
async fn health_endpoint_needs_no_tenant() {
    let control_plane = MockServer::start();
    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let request = Request::builder()
        .uri("/health")
        .header("host", "anything.local")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("healthy"));
}

#[tokio::test]
async fn unreachable_origin_maps_to_503() {
    let control_plane = MockServer::start();
    // nothing listens on port 1
    mock_tenant_config(
        &control_plane,
        "demo.local",
        support::tenant_payload("http://127.0.0.1:1", serde_json::json!([])),
    );

    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let request = Request::builder()
        .uri("/page")
        .header("host", "demo.local")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn rate_limited_client_gets_blocked_then_recovers() {
    let control_plane = MockServer::start();
    let origin = MockServer::start();
    origin.mock(|when, then| {
        when.method(GET).path("/api");
        then.status(200).body("ok");
    });
    let rules = serde_json::json!([
        {"rule_type": "rate_limit", "value": "2:2"}
    ]);
    mock_tenant_config(&control_plane, "demo.local", support::tenant_payload(&origin.base_url(), rules));

    let (kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let request = |_: u32| {
        Request::builder()
            .uri("/api")
            .header("host", "demo.local")
            .header("x-forwarded-for", "198.51.100.10")
            .body(Body::empty())
            .unwrap()
    };

    for i in 0..2 {
        let response = app.clone().oneshot(request(i)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i} within burst");
    }
    for i in 2..4 {
        let response = app.clone().oneshot(request(i)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "request {i} over burst");
    }

    kv.advance(1.0).await;
    let response = app.oneshot(request(4)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK, "tokens refill after quiescence");
}

#[tokio::test]
async fn recaptcha_challenge_clears_after_verification() {
    let control_plane = MockServer::start();
    let origin = MockServer::start();
    origin.mock(|when, then| {
        when.method(GET).path("/checkout");
        then.status(200).body("checkout");
    });
    let rules = serde_json::json!([
        {"rule_type": "recaptcha", "value": "enabled"}
    ]);
    mock_tenant_config(&control_plane, "demo.local", support::tenant_payload(&origin.base_url(), rules));

    let (kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let shop_request = || {
        Request::builder()
            .uri("/checkout")
            .header("host", "demo.local")
            .header("x-forwarded-for", "198.51.100.20")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(shop_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let challenge = body_string(response).await;
    assert!(challenge.contains("reCAPTCHA required"));
    assert!(challenge.contains(r#"data-sitekey="site-key""#));

    // debug builds accept the reserved test token
    let verify = Request::builder()
        .method("POST")
        .uri("/verify-recaptcha")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"token":"TEST_TOKEN","ip":"198.51.100.20"}"#,
        ))
        .unwrap();
    let response = app.clone().oneshot(verify).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("success"));
    assert!(kv.exists("recaptcha:198.51.100.20").await.unwrap());

    let response = app.oneshot(shop_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn verify_recaptcha_requires_both_fields() {
    let control_plane = MockServer::start();
    let (_kv, state) = support::state(&control_plane.base_url());
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/verify-recaptcha")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"token":"abc"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("Missing data"));
}

#[tokio::test]
async fn provider_rejection_returns_403() {
    let control_plane = MockServer::start();
    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST).path("/verify");
        then.status(200)
            .json_body(serde_json::json!({ "success": false }));
    });

    let (_kv, state) = support::state_with_recaptcha(
        &control_plane.base_url(),
        &format!("{}/verify", provider.base_url()),
    );
    let app = router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/verify-recaptcha")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"token":"wrong","ip":"198.51.100.20"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_string(response).await.contains("Verification failed"));
}
