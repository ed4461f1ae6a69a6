use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

// Redis dependencies (only used by the Redis implementation)
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Shared KV store used for rate-limit buckets, CAPTCHA markers and the
/// tenant-config cache. Multiple proxy workers point at the same store, so
/// all writes are last-writer-wins.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Store-side clock in fractional unix seconds. Using the store's clock
    /// keeps token buckets monotonic across workers with drifting clocks.
    async fn server_time(&self) -> Result<f64>;
}

// ---------------- Redis Implementation ----------------

#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self { manager })
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn server_time(&self) -> Result<f64> {
        let mut conn = self.manager.clone();
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs as f64 + micros as f64 / 1_000_000.0)
    }
}

// ---------------- In-Memory Implementation (Tests / Local Dev) ----------------

struct MemoryEntry {
    value: String,
    expires_at: Option<f64>,
}

/// In-memory stand-in with a manually advanced clock, so TTL and token-bucket
/// behavior can be exercised deterministically.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Mutex<f64>,
    failing: AtomicBool,
}

impl MemoryKv {
    const EPOCH: f64 = 1_700_000_000.0;

    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: Mutex::new(Self::EPOCH),
            failing: AtomicBool::new(false),
        }
    }

    /// Move the store clock forward.
    pub async fn advance(&self, secs: f64) {
        let mut clock = self.clock.lock().await;
        *clock += secs;
    }

    /// Test hook: make every operation fail, simulating an unreachable store.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("kv store unavailable");
        }
        Ok(())
    }

    async fn now(&self) -> f64 {
        *self.clock.lock().await
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = self.now().await;
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at.is_some_and(|at| at <= now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        let now = self.now().await;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl_secs as f64),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn server_time(&self) -> Result<f64> {
        self.check_available()?;
        Ok(self.now().await)
    }
}
