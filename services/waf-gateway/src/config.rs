use anyhow::{Context, Result};
use std::env;

const DEFAULT_RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

#[derive(Debug, Clone)]
pub struct WafConfig {
    pub control_plane_url: String,
    pub kv_store_url: String,
    pub upstream_timeout_secs: u64,
    pub config_cache_ttl_secs: u64,
    pub log_level: String,
    pub recaptcha_site_key: String,
    pub recaptcha_secret_key: String,
    pub recaptcha_verify_url: String,
    pub dashboard_origins: Vec<String>,
}

impl WafConfig {
    pub fn from_env() -> Result<Self> {
        let control_plane_url =
            env::var("CONTROL_PLANE_URL").context("CONTROL_PLANE_URL must be set")?;
        let kv_store_url = env::var("KV_STORE_URL").context("KV_STORE_URL must be set")?;
        let upstream_timeout_secs = env::var("WAF_TIMEOUT")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(30);
        let config_cache_ttl_secs = env::var("WAF_CACHE_TTL")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(300);
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let recaptcha_site_key = env::var("RECAPTCHA_SITE_KEY").unwrap_or_default();
        let recaptcha_secret_key = env::var("RECAPTCHA_SECRET_KEY").unwrap_or_default();
        let recaptcha_verify_url = env::var("RECAPTCHA_VERIFY_URL")
            .unwrap_or_else(|_| DEFAULT_RECAPTCHA_VERIFY_URL.to_string());
        let dashboard_origins = env::var("DASHBOARD_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|_| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:8000".to_string(),
                ]
            });

        Ok(Self {
            control_plane_url,
            kv_store_url,
            upstream_timeout_secs: upstream_timeout_secs.max(1),
            config_cache_ttl_secs: config_cache_ttl_secs.max(1),
            log_level,
            recaptcha_site_key,
            recaptcha_secret_key,
            recaptcha_verify_url,
            dashboard_origins,
        })
    }
}
