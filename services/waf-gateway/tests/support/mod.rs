#![allow(dead_code)]

use std::sync::Arc;
use waf_gateway::{AppState, MemoryKv, WafConfig};

pub fn config(control_plane_url: &str, recaptcha_verify_url: &str) -> Arc<WafConfig> {
    Arc::new(WafConfig {
        control_plane_url: control_plane_url.to_string(),
        kv_store_url: "redis://unused:6379/0".to_string(),
        upstream_timeout_secs: 5,
        config_cache_ttl_secs: 300,
        log_level: "info".to_string(),
        recaptcha_site_key: "site-key".to_string(),
        recaptcha_secret_key: "secret".to_string(),
        recaptcha_verify_url: recaptcha_verify_url.to_string(),
        dashboard_origins: vec!["http://localhost:3000".to_string()],
    })
}

/// AppState wired onto an in-memory KV store, pointed at a mock control
/// plane. The CAPTCHA verify URL defaults to a dead port; tests covering the
/// provider path pass their own.
pub fn state(control_plane_url: &str) -> (Arc<MemoryKv>, AppState) {
    state_with_recaptcha(control_plane_url, "http://127.0.0.1:1/verify")
}

pub fn state_with_recaptcha(
    control_plane_url: &str,
    recaptcha_verify_url: &str,
) -> (Arc<MemoryKv>, AppState) {
    let kv = Arc::new(MemoryKv::new());
    let state = AppState::new(config(control_plane_url, recaptcha_verify_url), kv.clone())
        .expect("failed to build app state");
    (kv, state)
}

/// Tenant config payload in the shape the control plane serves.
pub fn tenant_payload(target_url: &str, rules: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "id": 7,
        "client_name": "Demo Shop",
        "client_host": "demo.local",
        "target_url": target_url,
        "enable_ssl": true,
        "enable_rate_limiting": true,
        "enable_country_blocking": false,
        "blocked_countries": [],
        "allowed_countries": [],
        "enable_ip_blacklist": false,
        "ip_blacklist": [],
        "rules": rules,
    })
}
