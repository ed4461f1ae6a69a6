use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct WafMetrics {
    registry: Registry,
    requests: IntCounterVec,
    blocked: IntCounterVec,
    decision_seconds: Histogram,
    upstream_seconds: Histogram,
    dashboard_connections: IntGauge,
}

impl WafMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("waf_requests_total", "Requests classified by the WAF"),
            &["decision"],
        )?;
        let blocked = IntCounterVec::new(
            Opts::new("waf_blocked_total", "Blocked requests grouped by threat type"),
            &["threat_type"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(blocked.clone()))?;
        let decision_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "waf_decision_seconds",
                "Time spent classifying a request (seconds)",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let upstream_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "waf_upstream_seconds",
                "Time spent forwarding to the tenant origin (seconds)",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(decision_seconds.clone()))?;
        registry.register(Box::new(upstream_seconds.clone()))?;
        let dashboard_connections = IntGauge::with_opts(Opts::new(
            "waf_dashboard_connections",
            "Currently connected dashboard sessions",
        ))?;
        registry.register(Box::new(dashboard_connections.clone()))?;
        Ok(Self {
            registry,
            requests,
            blocked,
            decision_seconds,
            upstream_seconds,
            dashboard_connections,
        })
    }

    pub fn record_decision(&self, blocked: bool, elapsed_secs: f64) {
        let decision = if blocked { "blocked" } else { "allowed" };
        self.requests.with_label_values(&[decision]).inc();
        self.decision_seconds.observe(elapsed_secs);
    }

    pub fn record_blocked(&self, threat_type: &str) {
        self.blocked.with_label_values(&[threat_type]).inc();
    }

    pub fn observe_upstream(&self, elapsed_secs: f64) {
        self.upstream_seconds.observe(elapsed_secs);
    }

    pub fn dashboard_connected(&self) {
        self.dashboard_connections.inc();
    }

    pub fn dashboard_disconnected(&self) {
        self.dashboard_connections.dec();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
