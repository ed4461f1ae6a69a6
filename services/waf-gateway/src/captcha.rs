use crate::kv::KvStore;
use crate::throttle;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const KEY_PREFIX: &str = "recaptcha";
const SOLVED_TTL_SECS: u64 = 300;
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserved token that short-circuits provider verification in debug builds.
/// Release builds always go to the provider.
const DEBUG_TOKEN: &str = "TEST_TOKEN";

#[derive(Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
}

/// Tracks "solved recently" markers per client IP and verifies challenge
/// tokens with the external provider. Every degraded path fails open so a
/// broken provider or KV store cannot lock humans out.
pub struct CaptchaGate {
    kv: Arc<dyn KvStore>,
    http: Client,
    verify_url: String,
    secret: String,
}

impl CaptchaGate {
    pub fn new(kv: Arc<dyn KvStore>, http: Client, verify_url: &str, secret: &str) -> Self {
        Self {
            kv,
            http,
            verify_url: verify_url.to_string(),
            secret: secret.to_string(),
        }
    }

    /// True iff a solved marker exists for the address. KV failures count as
    /// solved.
    pub async fn is_solved(&self, ip: &str) -> bool {
        match self.kv.exists(&format!("{KEY_PREFIX}:{ip}")).await {
            Ok(found) => found,
            Err(err) => {
                if throttle::should_log("captcha-kv") {
                    warn!(client_ip = ip, error = %err, "KV store unavailable for CAPTCHA marker");
                }
                true
            }
        }
    }

    /// Verify a token with the provider and, on success, record the solved
    /// marker for 300 s. Provider transport errors also set the marker, to
    /// avoid self-denial while the provider is degraded.
    pub async fn verify_and_mark(&self, token: &str, ip: &str) -> bool {
        if cfg!(debug_assertions) && token == DEBUG_TOKEN {
            info!(client_ip = ip, "Accepting debug CAPTCHA token");
            self.mark_solved(ip).await;
            return true;
        }

        let params = [
            ("secret", self.secret.as_str()),
            ("response", token),
            ("remoteip", ip),
        ];
        match self
            .http
            .post(&self.verify_url)
            .form(&params)
            .timeout(VERIFY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => match resp.json::<VerifyResponse>().await {
                Ok(verdict) if verdict.success => {
                    self.mark_solved(ip).await;
                    true
                }
                Ok(_) => false,
                Err(err) => {
                    warn!(client_ip = ip, error = %err, "Undecodable CAPTCHA provider response, failing open");
                    self.mark_solved(ip).await;
                    true
                }
            },
            Err(err) => {
                if throttle::should_log("captcha-provider") {
                    warn!(client_ip = ip, error = %err, "CAPTCHA provider unreachable, failing open");
                }
                self.mark_solved(ip).await;
                true
            }
        }
    }

    async fn mark_solved(&self, ip: &str) {
        if let Err(err) = self
            .kv
            .set_ex(&format!("{KEY_PREFIX}:{ip}"), "1", SOLVED_TTL_SECS)
            .await
        {
            if throttle::should_log("captcha-kv") {
                warn!(client_ip = ip, error = %err, "Failed to store CAPTCHA marker");
            }
        }
    }
}
