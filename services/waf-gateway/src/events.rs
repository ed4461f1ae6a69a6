use crate::context::RequestContext;
use crate::tenant::{Decision, TenantConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Blocked-request record posted to the control plane's log store.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub client_host: String,
    pub ip_address: String,
    pub country_code: String,
    pub request_path: String,
    pub user_agent: String,
    pub reason: String,
    pub method: String,
    pub blocked: bool,
}

/// Live-dashboard frame describing one decision. Fanned out to admin
/// subscribers and to the owning tenant's subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub client_ip: String,
    pub client_name: String,
    pub client_id: String,
    pub host: String,
    pub path: String,
    pub method: String,
    pub user_agent: String,
    pub waf_blocked: bool,
    pub threat_type: String,
    pub timestamp: DateTime<Utc>,
    pub rule_id: Option<i64>,
    pub requests_per_second: f64,
}

impl RequestEvent {
    pub fn from_decision(ctx: &RequestContext, tenant: &TenantConfig, decision: &Decision) -> Self {
        let threat_type = if decision.blocked {
            decision.threat.unwrap_or("Unknown").to_string()
        } else {
            "none".to_string()
        };
        Self {
            kind: "request_event",
            client_ip: ctx.client_ip.to_string(),
            client_name: tenant.client_name.clone(),
            client_id: tenant.id.to_string(),
            host: tenant.client_host.clone(),
            path: ctx.path.clone(),
            method: ctx.method.to_string(),
            user_agent: ctx.user_agent.clone(),
            waf_blocked: decision.blocked,
            threat_type,
            timestamp: Utc::now(),
            rule_id: decision.rule_id,
            requests_per_second: 0.0,
        }
    }
}

/// Snapshot sent to a dashboard right after it connects.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub stats: DashboardStats,
    pub recent_activity: Vec<RequestEvent>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DashboardStats {
    pub total_requests: u64,
    pub total_blocked: u64,
    pub total_allowed: u64,
    pub requests_per_second: f64,
}
