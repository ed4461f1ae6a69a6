use crate::control_plane::ControlPlaneClient;
use crate::tenant::{Decision, TenantConfig};
use crate::throttle;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

/// Exact and CIDR blacklist check. Exact entries are scanned before ranges so
/// a listed address reports the address-level reason even when a range also
/// covers it. Malformed entries never block.
pub fn check_ip_blacklist(ip: IpAddr, tenant: &TenantConfig) -> Decision {
    if !tenant.enable_ip_blacklist {
        return Decision::allow();
    }

    for entry in &tenant.ip_blacklist {
        let entry = entry.trim();
        if entry.contains('/') {
            continue;
        }
        match entry.parse::<IpAddr>() {
            Ok(listed) if listed == ip => {
                return Decision::block(format!("IP {ip} is blacklisted"), 1.0)
                    .with_threat("IP Blacklist");
            }
            Ok(_) => {}
            Err(_) => {
                if throttle::should_log("blacklist-entry") {
                    warn!(entry, "Skipping malformed blacklist entry");
                }
            }
        }
    }

    for entry in &tenant.ip_blacklist {
        let entry = entry.trim();
        if !entry.contains('/') {
            continue;
        }
        match entry.parse::<IpNet>() {
            Ok(network) if network.contains(&ip) => {
                return Decision::block(
                    format!("IP {ip} is in blacklisted range {entry}"),
                    1.0,
                )
                .with_threat("IP Blacklist");
            }
            Ok(_) => {}
            Err(_) => {
                if throttle::should_log("blacklist-entry") {
                    warn!(entry, "Skipping malformed blacklist range");
                }
            }
        }
    }

    Decision::allow()
}

/// Country allow/block check. Private addresses are exempt, and a missing or
/// unresolvable country code passes the request (geo checks fail open).
/// A non-empty allow list supersedes the block list.
pub async fn check_country(
    ip: IpAddr,
    tenant: &TenantConfig,
    control_plane: &ControlPlaneClient,
) -> Decision {
    if !tenant.enable_country_blocking {
        return Decision::allow();
    }
    if is_private_ip(ip) {
        return Decision::allow();
    }

    let Some(code) = control_plane
        .get_ip_geolocation(ip)
        .await
        .and_then(|record| record.country_code)
        .filter(|code| !code.is_empty())
    else {
        return Decision::allow();
    };

    if !tenant.allowed_countries.is_empty() {
        if !tenant.allowed_countries.iter().any(|c| c == &code) {
            return Decision::block(format!("Country {code} not in allowed list"), 1.0)
                .with_threat("Country Block");
        }
    } else if tenant.blocked_countries.iter().any(|c| c == &code) {
        return Decision::block(format!("Country {code} is blocked"), 1.0)
            .with_threat("Country Block");
    }

    Decision::allow()
}

/// Private, loopback or link-local addresses never go through geolocation.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
