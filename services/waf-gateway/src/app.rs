use crate::captcha::CaptchaGate;
use crate::config::WafConfig;
use crate::control_plane::ControlPlaneClient;
use crate::engine::RuleEngine;
use crate::forward::proxy_passthrough;
use crate::handlers::{health, metrics_endpoint, root, stats, verify_recaptcha, ws_endpoint};
use crate::kv::KvStore;
use crate::metrics::WafMetrics;
use crate::middleware::waf_middleware;
use crate::telemetry::TelemetryHub;
use anyhow::{Context, Result};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Router};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WafConfig>,
    pub control_plane: Arc<ControlPlaneClient>,
    pub engine: Arc<RuleEngine>,
    pub captcha: Arc<CaptchaGate>,
    pub hub: Arc<TelemetryHub>,
    pub metrics: Arc<WafMetrics>,
    pub http_client: Client,
}

impl AppState {
    /// Wire every component onto the given KV store. One pooled HTTP client
    /// serves the control plane, the CAPTCHA provider and upstream
    /// forwarding; timeouts are set per call.
    pub fn new(config: Arc<WafConfig>, kv: Arc<dyn KvStore>) -> Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(32)
            .build()
            .context("Failed to build HTTP client")?;
        let control_plane = Arc::new(ControlPlaneClient::new(
            &config.control_plane_url,
            http_client.clone(),
            kv.clone(),
            config.config_cache_ttl_secs,
        ));
        let captcha = Arc::new(CaptchaGate::new(
            kv.clone(),
            http_client.clone(),
            &config.recaptcha_verify_url,
            &config.recaptcha_secret_key,
        ));
        let engine = Arc::new(RuleEngine::new(kv, captcha.clone()));
        let metrics = Arc::new(WafMetrics::new()?);

        Ok(Self {
            config,
            control_plane,
            engine,
            captcha,
            hub: Arc::new(TelemetryHub::new()),
            metrics,
            http_client,
        })
    }
}

/// Gateway router: the service's own endpoints, the WAF layer over
/// everything, and the fallback that forwards tenant traffic upstream.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            state
                .config
                .dashboard_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE]);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics_endpoint))
        .route("/ws", get(ws_endpoint))
        .route("/verify-recaptcha", post(verify_recaptcha))
        .fallback(proxy_passthrough)
        .layer(middleware::from_fn_with_state(state.clone(), waf_middleware))
        .layer(cors)
        .with_state(state)
}
