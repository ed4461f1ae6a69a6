use crate::kv::KvStore;
use anyhow::Result;
use std::sync::Arc;

const KEY_PREFIX: &str = "rate_limit";
const STATE_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: f64,
}

/// Token bucket keyed by client IP, persisted in the shared KV store as
/// `rate_limit:<ip>` → `"<last_update>:<tokens>"`. Time comes from the store
/// itself so workers with drifting clocks refill consistently. There is no
/// cross-worker lock; concurrent readers may each admit one extra token per
/// interval, which is accepted.
pub struct TokenBucketLimiter {
    kv: Arc<dyn KvStore>,
}

impl TokenBucketLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn acquire(&self, ip: &str, rps: f64, burst: u32) -> Result<RateDecision> {
        let key = format!("{KEY_PREFIX}:{ip}");
        let now = self.kv.server_time().await?;

        let (last_update, tokens) = match self.kv.get(&key).await? {
            Some(raw) => parse_bucket(&raw).unwrap_or((now, burst as f64)),
            None => (now, burst as f64),
        };

        let mut tokens = (tokens + (now - last_update) * rps).min(burst as f64);
        if tokens >= 1.0 {
            tokens -= 1.0;
            self.kv
                .set_ex(&key, &format!("{now}:{tokens}"), STATE_TTL_SECS)
                .await?;
            Ok(RateDecision {
                allowed: true,
                remaining: tokens,
            })
        } else {
            Ok(RateDecision {
                allowed: false,
                remaining: tokens,
            })
        }
    }
}

fn parse_bucket(raw: &str) -> Option<(f64, f64)> {
    let (last, tokens) = raw.split_once(':')?;
    Some((last.parse().ok()?, tokens.parse().ok()?))
}

/// Parse a rule value of the form `"rps:burst"`. Both components must be
/// positive; anything else is rejected and the rule does not block.
pub fn parse_rate_value(value: &str) -> Option<(f64, u32)> {
    let (rps_raw, burst_raw) = value.split_once(':')?;
    let rps: f64 = rps_raw.trim().parse().ok()?;
    let burst: u32 = burst_raw.trim().parse().ok()?;
    (rps > 0.0 && burst > 0).then_some((rps, burst))
}
