use crate::captcha::CaptchaGate;
use crate::context::RequestContext;
use crate::kv::KvStore;
use crate::rate_limit::{parse_rate_value, TokenBucketLimiter};
use crate::tenant::{Decision, Rule, RuleKind, TenantConfig};
use crate::throttle;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Headers whose decoded values join the scan surface.
const SCAN_HEADERS: [&str; 6] = [
    "cookie",
    "referer",
    "x-forwarded-for",
    "x-forwarded-host",
    "origin",
    "host",
];

/// Upper bound on the scan surface, in characters.
const MAX_SCAN_CHARS: usize = 10_000;

/// Patterns outside this length band are ignored.
const MIN_PATTERN_LEN: usize = 1;
const MAX_PATTERN_LEN: usize = 500;

/// Patterns shorter than this and made only of `[A-Za-z0-9 ._-]` are matched
/// as plain substrings instead of regexes.
const SIMPLE_PATTERN_LEN: usize = 50;

/// Stateless evaluation of one request against a tenant's ordered rule list.
/// Pattern kinds are pure CPU; rate_limit and recaptcha consult the shared
/// KV store. Any handler failure fails open for that rule only.
pub struct RuleEngine {
    limiter: TokenBucketLimiter,
    captcha: Arc<CaptchaGate>,
    // Compiled regexes are cached per process; rule values change only with
    // a fresh TenantConfig, and failed compiles are remembered as None.
    regex_cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl RuleEngine {
    pub fn new(kv: Arc<dyn KvStore>, captcha: Arc<CaptchaGate>) -> Self {
        Self {
            limiter: TokenBucketLimiter::new(kv),
            captcha,
            regex_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate active rules in severity order; the first blocking rule wins
    /// and stamps the decision with its id and severity.
    pub async fn check(&self, ctx: &RequestContext, tenant: &TenantConfig) -> Decision {
        if tenant.rules.is_empty() {
            debug!("No rules to check against");
            return Decision::allow();
        }

        let scan = scan_surface(ctx);
        debug!(
            client_ip = %ctx.client_ip,
            rules = tenant.rules.len(),
            "Scanning request"
        );

        let mut rules: Vec<&Rule> = tenant.rules.iter().filter(|rule| rule.is_active).collect();
        rules.sort_by_key(|rule| rule.severity.priority());

        for rule in rules {
            let mut decision = self.apply_rule(rule, &scan, ctx, tenant).await;
            if decision.blocked {
                decision.rule_id = rule.id;
                decision.severity = rule.severity;
                if decision.threat.is_none() {
                    decision.threat = Some(rule.rule_type.display_name());
                }
                warn!(
                    client_ip = %ctx.client_ip,
                    rule_id = ?rule.id,
                    reason = decision.reason.as_deref().unwrap_or_default(),
                    "Request blocked by rule"
                );
                return decision;
            }
        }

        debug!(client_ip = %ctx.client_ip, "Request passed all security checks");
        Decision::allow()
    }

    async fn apply_rule(
        &self,
        rule: &Rule,
        scan: &str,
        ctx: &RequestContext,
        tenant: &TenantConfig,
    ) -> Decision {
        match rule.rule_type {
            RuleKind::SqlInjection => {
                self.match_patterns(&rule.value, scan, "SQL Injection pattern detected", 0.9)
            }
            RuleKind::Xss => self.match_patterns(&rule.value, scan, "XSS pattern detected", 0.8),
            RuleKind::PathTraversal | RuleKind::Lfi => {
                self.match_patterns(&rule.value, scan, "Path traversal pattern detected", 0.7)
            }
            RuleKind::Rce | RuleKind::Rfi => {
                self.match_patterns(&rule.value, scan, "RCE pattern detected", 0.8)
            }
            RuleKind::UaBlock => check_user_agent(&rule.value, &ctx.user_agent),
            RuleKind::RateLimit => self.check_rate_limit(rule, ctx, tenant).await,
            RuleKind::Recaptcha => {
                if self.captcha.is_solved(&ctx.client_ip.to_string()).await {
                    Decision::allow()
                } else {
                    Decision::block("reCAPTCHA required", 0.5)
                }
            }
            RuleKind::Unknown => Decision::allow(),
        }
    }

    async fn check_rate_limit(
        &self,
        rule: &Rule,
        ctx: &RequestContext,
        tenant: &TenantConfig,
    ) -> Decision {
        if !tenant.enable_rate_limiting {
            return Decision::allow();
        }
        let Some((rps, burst)) = parse_rate_value(&rule.value) else {
            warn!(value = %rule.value, "Invalid rate limit configuration");
            return Decision::allow();
        };
        let ip = ctx.client_ip.to_string();
        match self.limiter.acquire(&ip, rps, burst).await {
            Ok(decision) if decision.allowed => Decision::allow(),
            Ok(_) => Decision::block(format!("Rate limit exceeded for {ip}"), 1.0),
            Err(err) => {
                if throttle::should_log("rate-limit-kv") {
                    warn!(client_ip = %ip, error = %err, "Rate limiter unavailable, failing open");
                }
                Decision::allow()
            }
        }
    }

    fn match_patterns(&self, value: &str, scan: &str, label: &str, confidence: f64) -> Decision {
        for pattern in parse_patterns(value) {
            for candidate in test_patterns(pattern) {
                if self.pattern_matches(&candidate, scan) {
                    return Decision::block(format!("{label}: {pattern}"), confidence);
                }
            }
        }
        Decision::allow()
    }

    fn pattern_matches(&self, pattern: &str, scan: &str) -> bool {
        if is_simple_pattern(pattern) {
            // scan surface is already lower-cased
            return scan.contains(&pattern.to_lowercase());
        }
        let mut cache = self.regex_cache.lock().unwrap_or_else(|e| e.into_inner());
        let compiled = cache.entry(pattern.to_string()).or_insert_with(|| {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(pattern, error = %err, "Invalid regex pattern, skipping");
                    None
                }
            }
        });
        compiled.as_ref().is_some_and(|regex| regex.is_match(scan))
    }
}

/// Lower-cased concatenation of path, decoded query, decoded body and the
/// decoded values of the security-relevant headers, truncated to 10k chars.
pub fn scan_surface(ctx: &RequestContext) -> String {
    let mut data = String::with_capacity(
        ctx.path.len() + ctx.query.len() + ctx.body.len() + 64,
    );
    data.push_str(&ctx.path);
    data.push(' ');
    data.push_str(&url_decode(&ctx.query));
    data.push(' ');
    data.push_str(&url_decode(&ctx.body));
    for name in SCAN_HEADERS {
        if let Some(value) = ctx.headers.get(name) {
            data.push(' ');
            data.push_str(&url_decode(value));
        }
    }

    let data = data.to_lowercase();
    if data.chars().count() > MAX_SCAN_CHARS {
        warn!("Scan data truncated due to size limits");
        data.chars().take(MAX_SCAN_CHARS).collect()
    } else {
        data
    }
}

/// `unquote_plus` semantics: `+` becomes a space, then percent-decoding.
/// Undecodable input is left as-is rather than dropped.
fn url_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

fn parse_patterns(value: &str) -> impl Iterator<Item = &str> {
    value
        .lines()
        .map(str::trim)
        .filter(|p| (MIN_PATTERN_LEN..=MAX_PATTERN_LEN).contains(&p.len()))
}

/// Expand one user pattern into the encoded variants attackers use to smuggle
/// it past naive filters: URL-encoded, double-URL-encoded and HTML-entity
/// forms. Variants identical to their base are dropped.
fn test_patterns(pattern: &str) -> Vec<String> {
    let mut patterns = vec![pattern.to_string()];

    let url_encoded = pattern
        .replace('\'', "%27")
        .replace(' ', "%20")
        .replace('=', "%3D");
    if url_encoded != pattern {
        let double_encoded = url_encoded.replace('%', "%25");
        patterns.push(url_encoded);
        patterns.push(double_encoded);
    }

    let html_encoded = pattern.replace('<', "&lt;").replace('>', "&gt;");
    if html_encoded != pattern {
        patterns.push(html_encoded);
    }

    patterns
}

fn is_simple_pattern(pattern: &str) -> bool {
    pattern.len() < SIMPLE_PATTERN_LEN
        && pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || " ._-".contains(c))
}

fn check_user_agent(value: &str, user_agent: &str) -> Decision {
    if user_agent.is_empty() {
        return Decision::allow();
    }
    let user_agent = user_agent.to_lowercase();
    for pattern in parse_patterns(value) {
        if user_agent.contains(&pattern.to_lowercase()) {
            return Decision::block(format!("Blocked User Agent: {pattern}"), 0.9);
        }
    }
    Decision::allow()
}
