//! Outbound URL policy.
//!
//! Runs before auth resolution so credentials are never fetched for a
//! disallowed destination. Outside local mode the policy requires HTTPS
//! and blocks loopback, RFC 1918 / link-local, and ULA targets.

use sluice_error::DeliveryError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// URL policy configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlPolicy {
    /// Allow plain HTTP and private/loopback targets (local development)
    pub allow_insecure: bool,
}

impl UrlPolicy {
    /// Production policy: HTTPS only, public addresses only.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            allow_insecure: false,
        }
    }

    /// Local-development policy: anything goes.
    #[must_use]
    pub const fn permissive() -> Self {
        Self {
            allow_insecure: true,
        }
    }

    /// Validate a target URL against the policy.
    pub fn validate(&self, url: &str) -> Result<(), DeliveryError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| DeliveryError::UrlPolicy {
            reason: format!("invalid URL '{url}': {e}"),
        })?;

        match parsed.scheme() {
            "https" => {},
            "http" if self.allow_insecure => {},
            "http" => {
                return Err(DeliveryError::UrlPolicy {
                    reason: "HTTPS is required outside local mode".to_string(),
                });
            },
            other => {
                return Err(DeliveryError::UrlPolicy {
                    reason: format!("unsupported scheme '{other}'"),
                });
            },
        }

        if self.allow_insecure {
            return Ok(());
        }

        let Some(host) = parsed.host_str() else {
            return Err(DeliveryError::UrlPolicy {
                reason: "URL has no host".to_string(),
            });
        };

        if host.eq_ignore_ascii_case("localhost") || host.ends_with(".localhost") {
            return Err(DeliveryError::UrlPolicy {
                reason: "loopback host is blocked".to_string(),
            });
        }

        // Literal IP hosts are checked directly; hostnames resolving to
        // private ranges are caught by the connector-level block list in
        // deployments that need it.
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            if let Some(reason) = blocked_ip_reason(ip) {
                return Err(DeliveryError::UrlPolicy { reason });
            }
        }

        Ok(())
    }
}

fn blocked_ip_reason(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(v4) => blocked_v4(v4),
        IpAddr::V6(v6) => blocked_v6(v6),
    }
}

fn blocked_v4(ip: Ipv4Addr) -> Option<String> {
    if ip.is_loopback() {
        return Some("loopback address is blocked".to_string());
    }
    if ip.is_private() {
        return Some(format!("private address {ip} is blocked"));
    }
    if ip.is_link_local() {
        return Some(format!("link-local address {ip} is blocked"));
    }
    if ip.is_unspecified() {
        return Some("unspecified address is blocked".to_string());
    }
    None
}

fn blocked_v6(ip: Ipv6Addr) -> Option<String> {
    if ip.is_loopback() {
        return Some("loopback address is blocked".to_string());
    }
    if ip.is_unspecified() {
        return Some("unspecified address is blocked".to_string());
    }
    // fc00::/7 unique-local
    if (ip.segments()[0] & 0xfe00) == 0xfc00 {
        return Some(format!("unique-local address {ip} is blocked"));
    }
    // fe80::/10 link-local
    if (ip.segments()[0] & 0xffc0) == 0xfe80 {
        return Some(format!("link-local address {ip} is blocked"));
    }
    // IPv4-mapped addresses carry the embedded address's classification
    if let Some(v4) = ip.to_ipv4_mapped() {
        return blocked_v4(v4);
    }
    None
}
