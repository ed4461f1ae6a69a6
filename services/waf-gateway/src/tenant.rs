use serde::{Deserialize, Serialize};

/// Per-host configuration snapshot served by the control plane.
///
/// Field names mirror the control-plane JSON; unknown fields are ignored so
/// the data plane keeps working when the admin side grows new attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_host: String,
    pub target_url: String,
    #[serde(default = "default_true")]
    pub enable_ssl: bool,
    #[serde(default = "default_true")]
    pub enable_rate_limiting: bool,
    #[serde(default)]
    pub enable_country_blocking: bool,
    #[serde(default)]
    pub enable_ip_blacklist: bool,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default)]
    pub ip_blacklist: Vec<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: Option<i64>,
    pub rule_type: RuleKind,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Rule vocabulary of the control plane. Tags the data plane does not know
/// deserialize to `Unknown` and are skipped during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    SqlInjection,
    Xss,
    RateLimit,
    UaBlock,
    PathTraversal,
    Rce,
    Lfi,
    Rfi,
    Recaptcha,
    #[serde(other)]
    Unknown,
}

impl RuleKind {
    /// Display name used as `threat_type` in dashboard events.
    pub fn display_name(&self) -> &'static str {
        match self {
            RuleKind::SqlInjection => "SQL Injection",
            RuleKind::Xss => "Cross-Site Scripting",
            RuleKind::RateLimit => "Rate Limiting",
            RuleKind::UaBlock => "User Agent Blocking",
            RuleKind::PathTraversal => "Path Traversal",
            RuleKind::Rce => "Remote Code Execution",
            RuleKind::Lfi => "Local File Inclusion",
            RuleKind::Rfi => "Remote File Inclusion",
            RuleKind::Recaptcha => "reCAPTCHA Challenge",
            RuleKind::Unknown => "Unknown",
        }
    }
}

/// Severity drives evaluation order: critical rules run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Low,
    #[default]
    #[serde(other)]
    Medium,
}

impl Severity {
    pub fn priority(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }
}

/// Outcome of classifying one request. Never carries control-plane state.
#[derive(Debug, Clone)]
pub struct Decision {
    pub blocked: bool,
    pub reason: Option<String>,
    pub rule_id: Option<i64>,
    pub severity: Severity,
    pub confidence: f64,
    /// Display name of the matching check, used as `threat_type` downstream.
    pub threat: Option<&'static str>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
            rule_id: None,
            severity: Severity::Medium,
            confidence: 0.0,
            threat: None,
        }
    }

    pub fn block(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
            rule_id: None,
            severity: Severity::Medium,
            confidence,
            threat: None,
        }
    }

    pub fn with_threat(mut self, threat: &'static str) -> Self {
        self.threat = Some(threat);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_config_parses_control_plane_payload() {
        let raw = serde_json::json!({
            "id": 7,
            "client_name": "Demo Shop",
            "client_host": "demo.local",
            "target_url": "http://origin.local",
            "security_level": "balanced",
            "enable_ssl": true,
            "enable_rate_limiting": true,
            "enable_country_blocking": false,
            "blocked_countries": [],
            "allowed_countries": [],
            "enable_ip_blacklist": true,
            "ip_blacklist": ["10.0.0.0/24"],
            "rules": [
                {"id": 1, "rule_type": "sql_injection", "value": "' OR '1'='1", "severity": "high", "is_active": true},
                {"rule_type": "some_future_kind", "value": "x"}
            ],
            "site_type": "ecommerce"
        });
        let config: TenantConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.client_host, "demo.local");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].rule_type, RuleKind::SqlInjection);
        assert_eq!(config.rules[0].severity, Severity::High);
        assert_eq!(config.rules[1].rule_type, RuleKind::Unknown);
        assert!(config.rules[1].is_active);
    }

    #[test]
    fn unknown_severity_defaults_to_medium() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "rule_type": "xss",
            "value": "<script>",
            "severity": "catastrophic"
        }))
        .unwrap();
        assert_eq!(rule.severity, Severity::Medium);
    }

    #[test]
    fn severity_priority_orders_critical_first() {
        let mut severities = [Severity::Low, Severity::Critical, Severity::Medium, Severity::High];
        severities.sort_by_key(Severity::priority);
        assert_eq!(
            severities,
            [Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
        );
    }
}
