pub mod access;
pub mod app;
pub mod captcha;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod engine;
pub mod events;
pub mod forward;
pub mod handlers;
pub mod kv;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod telemetry;
pub mod tenant;
pub mod throttle;

// Re-export key types for tests
pub use crate::app::{router, AppState};
pub use crate::config::WafConfig;
pub use crate::control_plane::{ConfigLookup, ControlPlaneClient};
pub use crate::kv::{KvStore, MemoryKv, RedisKv};
pub use crate::telemetry::{SubscriberKind, TelemetryHub};
pub use crate::tenant::{Decision, Rule, RuleKind, Severity, TenantConfig};
