use crate::events::SecurityEvent;
use crate::kv::KvStore;
use crate::tenant::TenantConfig;
use crate::throttle;
use axum::http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_CACHE_PREFIX: &str = "waf:v1:config";
const NEGATIVE_SENTINEL: &str = r#"{"error":"not_found"}"#;
const NEGATIVE_TTL_SECS: u64 = 60;
const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);
const GEO_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a tenant-config lookup. `Unavailable` covers transient
/// control-plane failures and is never written to the cache.
pub enum ConfigLookup {
    Found(Arc<TenantConfig>),
    NotConfigured,
    Unavailable,
}

/// The only geolocation field the data plane reads.
#[derive(Debug, Clone, Deserialize)]
pub struct GeolocationRecord {
    #[serde(default)]
    pub country_code: Option<String>,
}

/// HTTP client for the control plane, with the tenant-config cache layered
/// over the shared KV store so warm entries are shared between workers.
pub struct ControlPlaneClient {
    base_url: String,
    http: Client,
    kv: Arc<dyn KvStore>,
    cache_ttl_secs: u64,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, http: Client, kv: Arc<dyn KvStore>, cache_ttl_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            kv,
            cache_ttl_secs,
        }
    }

    /// Fetch the config snapshot for a normalized host, consulting the cache
    /// first. Positive entries live `cache_ttl_secs`, the not-found sentinel
    /// 60 s. Corrupt entries are deleted and treated as a miss. Concurrent
    /// misses may fetch concurrently; the last writer wins.
    pub async fn get_tenant_config(&self, host: &str) -> ConfigLookup {
        let cache_key = format!("{CONFIG_CACHE_PREFIX}:{host}");

        match self.kv.get(&cache_key).await {
            Ok(Some(raw)) => {
                if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                    if value.get("error").and_then(Value::as_str) == Some("not_found") {
                        debug!(host, "Tenant config negative-cache hit");
                        return ConfigLookup::NotConfigured;
                    }
                    if let Ok(config) = serde_json::from_value::<TenantConfig>(value) {
                        return ConfigLookup::Found(Arc::new(config));
                    }
                }
                warn!(host, "Corrupted cached tenant config, refetching");
                if let Err(err) = self.kv.del(&cache_key).await {
                    warn!(host, error = %err, "Failed to drop corrupted cache entry");
                }
            }
            Ok(None) => {}
            Err(err) => {
                if throttle::should_log("config-cache-kv") {
                    warn!(error = %err, "KV store unavailable for config cache, fetching directly");
                }
            }
        }

        let url = format!("{}/clients/api/v1/clients/{host}/waf-config/", self.base_url);
        debug!(%url, "Fetching tenant config");
        match self.http.get(&url).timeout(CONFIG_TIMEOUT).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => match resp.json::<TenantConfig>().await {
                Ok(config) => {
                    info!(host, client = %config.client_name, "Retrieved tenant config");
                    if let Ok(serialized) = serde_json::to_string(&config) {
                        if let Err(err) =
                            self.kv.set_ex(&cache_key, &serialized, self.cache_ttl_secs).await
                        {
                            if throttle::should_log("config-cache-kv") {
                                warn!(host, error = %err, "Failed to cache tenant config");
                            }
                        }
                    }
                    ConfigLookup::Found(Arc::new(config))
                }
                Err(err) => {
                    warn!(host, error = %err, "Undecodable tenant config payload");
                    ConfigLookup::Unavailable
                }
            },
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                warn!(host, "No tenant configured");
                if let Err(err) = self
                    .kv
                    .set_ex(&cache_key, NEGATIVE_SENTINEL, NEGATIVE_TTL_SECS)
                    .await
                {
                    if throttle::should_log("config-cache-kv") {
                        warn!(host, error = %err, "Failed to negative-cache tenant config");
                    }
                }
                ConfigLookup::NotConfigured
            }
            Ok(resp) => {
                warn!(host, status = %resp.status(), "Control plane returned unexpected status");
                ConfigLookup::Unavailable
            }
            Err(err) => {
                if throttle::should_log("config-fetch") {
                    warn!(host, error = %err, "Failed to reach control plane for tenant config");
                }
                ConfigLookup::Unavailable
            }
        }
    }

    /// Best-effort geolocation lookup. Any failure is reported as `None`,
    /// which disables country checks for the request.
    pub async fn get_ip_geolocation(&self, ip: IpAddr) -> Option<GeolocationRecord> {
        let url = format!("{}/api/v1/ip-geolocation/{ip}/", self.base_url);
        match self.http.get(&url).timeout(GEO_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<GeolocationRecord>().await {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(client_ip = %ip, error = %err, "Undecodable geolocation payload");
                    None
                }
            },
            Ok(resp) => {
                debug!(client_ip = %ip, status = %resp.status(), "Geolocation lookup failed");
                None
            }
            Err(err) => {
                if throttle::should_log("geolocation") {
                    warn!(client_ip = %ip, error = %err, "Failed to reach geolocation service");
                }
                None
            }
        }
    }

    /// Fire-and-forget emission of a blocked-request event. Failures are
    /// logged and swallowed; the data plane never retries.
    pub async fn log_security_event(&self, event: &SecurityEvent) {
        let url = format!("{}/logs/api/v1/security-events/", self.base_url);
        match self.http.post(&url).json(event).timeout(EVENT_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(host = %event.client_host, "Security event logged");
            }
            Ok(resp) => {
                warn!(host = %event.client_host, status = %resp.status(), "Failed to log security event");
            }
            Err(err) => {
                if throttle::should_log("security-events") {
                    warn!(host = %event.client_host, error = %err, "Failed to post security event");
                }
            }
        }
    }
}
