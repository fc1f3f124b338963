//! Destination-host admission for host-mediated network access.
//!
//! Loopback, private-network, link-local and cloud-metadata destinations
//! are refused before any policy rule is consulted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{ConfigError, ConfigResult};

/// Hostnames that resolve to internal services on common platforms.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "metadata",
    "metadata.google.internal",
    "instance-data",
    "instance-data.ec2.internal",
];

/// A host pattern: an exact name or one leading wildcard label (`*.example.com`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HostPattern {
    Exact(String),
    /// Stores the suffix without the `*.`; matches strict subdomains only.
    Wildcard(String),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> ConfigResult<Self> {
        let invalid = |reason: &str| ConfigError::InvalidHostPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let normalized = normalize_host(pattern);
        if normalized.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let (wildcard, rest) = match normalized.strip_prefix("*.") {
            Some(rest) => (true, rest.to_string()),
            None => (false, normalized),
        };

        if rest.contains('*') {
            return Err(invalid("only a single leading '*.' label is supported"));
        }
        if rest.is_empty() || rest.starts_with('.') || rest.ends_with('.') || rest.contains("..") {
            return Err(invalid("malformed host name"));
        }
        if rest.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return Err(invalid("host name contains an invalid character"));
        }

        Ok(if wildcard {
            HostPattern::Wildcard(rest)
        } else {
            HostPattern::Exact(rest)
        })
    }

    /// `host` must already be normalized.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(name) => host == name,
            HostPattern::Wildcard(suffix) => host
                .strip_suffix(suffix.as_str())
                .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Exact(name) => f.write_str(name),
            HostPattern::Wildcard(suffix) => write!(f, "*.{}", suffix),
        }
    }
}

impl FromStr for HostPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostPattern::parse(s)
    }
}

impl TryFrom<String> for HostPattern {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        HostPattern::parse(&value)
    }
}

impl From<HostPattern> for String {
    fn from(pattern: HostPattern) -> Self {
        pattern.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub default_allow: bool,
    /// Checked in order; the first match admits the host.
    pub allowed_hosts: Vec<HostPattern>,
    pub denied_hosts: Vec<HostPattern>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            default_allow: false,
            allowed_hosts: Vec::new(),
            denied_hosts: Vec::new(),
        }
    }
}

impl NetworkPolicy {
    /// Build a policy from pattern strings, rejecting any malformed pattern.
    pub fn new<A, D>(default_allow: bool, allowed: &[A], denied: &[D]) -> ConfigResult<Self>
    where
        A: AsRef<str>,
        D: AsRef<str>,
    {
        let mut allowed_hosts: Vec<HostPattern> = Vec::with_capacity(allowed.len());
        for pattern in allowed {
            let parsed = HostPattern::parse(pattern.as_ref())?;
            if !allowed_hosts.contains(&parsed) {
                allowed_hosts.push(parsed);
            }
        }
        let mut denied_hosts: Vec<HostPattern> = Vec::with_capacity(denied.len());
        for pattern in denied {
            let parsed = HostPattern::parse(pattern.as_ref())?;
            if !denied_hosts.contains(&parsed) {
                denied_hosts.push(parsed);
            }
        }
        Ok(Self {
            default_allow,
            allowed_hosts,
            denied_hosts,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetDenyReason {
    /// Loopback, private, link-local or otherwise internal address.
    InternalAddress,
    /// A hostname reserved for local or metadata services.
    InternalHostname,
    /// A numeric form (`2130706433`, `0x7f.1`) that resolvers may read as an IP.
    AmbiguousNumericHost,
    InvalidHost,
    DeniedHost,
    DefaultDeny,
}

impl NetDenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetDenyReason::InternalAddress => "internal_address",
            NetDenyReason::InternalHostname => "internal_hostname",
            NetDenyReason::AmbiguousNumericHost => "ambiguous_numeric_host",
            NetDenyReason::InvalidHost => "invalid_host",
            NetDenyReason::DeniedHost => "denied_host",
            NetDenyReason::DefaultDeny => "default_deny",
        }
    }
}

impl fmt::Display for NetDenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetAccessDecision {
    pub allowed: bool,
    /// Lowercased host with brackets and trailing dot removed.
    pub host: String,
    pub reason: Option<NetDenyReason>,
}

/// Evaluates destination hosts against a [`NetworkPolicy`].
#[derive(Debug, Clone)]
pub struct NetworkAccessControl {
    policy: NetworkPolicy,
}

impl NetworkAccessControl {
    pub fn new(policy: NetworkPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &NetworkPolicy {
        &self.policy
    }

    pub fn check_host_access(&self, host: &str) -> bool {
        self.evaluate(host).allowed
    }

    pub fn evaluate(&self, host: &str) -> NetAccessDecision {
        let host = normalize_host(host);
        let decide = |reason: Option<NetDenyReason>| NetAccessDecision {
            allowed: reason.is_none(),
            host: host.clone(),
            reason,
        };

        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return decide(Some(NetDenyReason::InvalidHost));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_internal_ip(&ip) {
                return decide(Some(NetDenyReason::InternalAddress));
            }
        } else if is_ambiguous_numeric(&host) {
            return decide(Some(NetDenyReason::AmbiguousNumericHost));
        } else if is_internal_hostname(&host) {
            return decide(Some(NetDenyReason::InternalHostname));
        }

        if self.policy.denied_hosts.iter().any(|p| p.matches(&host)) {
            return decide(Some(NetDenyReason::DeniedHost));
        }
        if self.policy.allowed_hosts.iter().any(|p| p.matches(&host)) {
            return decide(None);
        }
        if self.policy.default_allow {
            decide(None)
        } else {
            decide(Some(NetDenyReason::DefaultDeny))
        }
    }
}

fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);
    unbracketed.trim_end_matches('.').to_ascii_lowercase()
}

fn is_internal_hostname(host: &str) -> bool {
    BLOCKED_HOSTNAMES.contains(&host) || host.ends_with(".localhost") || host.ends_with(".internal")
}

/// Hosts made only of digits, dots and hex prefixes are IPs to some
/// resolvers (`inet_aton` accepts `127.1`, `0x7f000001`, `2130706433`).
fn is_ambiguous_numeric(host: &str) -> bool {
    host.split('.').all(|label| {
        let label = label.strip_prefix("0x").unwrap_or(label);
        !label.is_empty() && label.chars().all(|c| c.is_ascii_hexdigit())
    }) && host.chars().any(|c| c.is_ascii_digit())
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => is_internal_v6(v6),
    }
}

fn is_internal_v4(v4: &Ipv4Addr) -> bool {
    let o = v4.octets();
    v4.is_loopback()                                  // 127.0.0.0/8
        || v4.is_private()                            // 10/8, 172.16/12, 192.168/16
        || v4.is_link_local()                         // 169.254/16, incl. 169.254.169.254
        || v4.is_unspecified()                        // 0.0.0.0
        || o[0] == 0                                  // 0.0.0.0/8
        || v4.is_broadcast()                          // 255.255.255.255
        || (o[0] == 100 && (o[1] & 0xC0) == 64)       // 100.64.0.0/10 (CGNAT)
        || (o[0] == 198 && (o[1] & 0xFE) == 18)       // 198.18.0.0/15
        || o[0] >= 224                                // multicast + reserved
}

fn is_internal_v6(v6: &Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_loopback()                                  // ::1
        || v6.is_unspecified()                        // ::
        || (first & 0xFE00) == 0xFC00                 // fc00::/7 (ULA)
        || (first & 0xFFC0) == 0xFE80                 // fe80::/10
        || (first & 0xFFC0) == 0xFEC0                 // fec0::/10 (site-local)
        || (first & 0xFF00) == 0xFF00                 // ff00::/8
        || v6.to_ipv4_mapped().is_some_and(|v4| is_internal_v4(&v4))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(default_allow: bool, allowed: &[&str], denied: &[&str]) -> NetworkAccessControl {
        NetworkAccessControl::new(NetworkPolicy::new(default_allow, allowed, denied).unwrap())
    }

    #[test]
    fn test_private_ip_denied_even_when_allowed() {
        let net = control(true, &["192.168.1.1"], &[]);
        assert!(!net.check_host_access("192.168.1.1"));
        assert_eq!(
            net.evaluate("192.168.1.1").reason,
            Some(NetDenyReason::InternalAddress)
        );
    }

    #[test]
    fn test_internal_addresses_denied() {
        let net = control(true, &[], &[]);
        for host in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "169.254.169.254",
            "0.0.0.0",
            "::1",
            "[::1]",
            "fd00::1",
            "fe80::1",
            "::ffff:127.0.0.1",
            "::ffff:169.254.169.254",
            "localhost",
            "LOCALHOST.",
            "api.localhost",
            "metadata.google.internal",
        ] {
            assert!(!net.check_host_access(host), "{} should be denied", host);
        }
    }

    #[test]
    fn test_ambiguous_numeric_hosts_denied() {
        let net = control(true, &[], &[]);
        for host in ["2130706433", "0x7f.1", "127.1", "0x7f000001"] {
            assert_eq!(
                net.evaluate(host).reason,
                Some(NetDenyReason::AmbiguousNumericHost),
                "{}",
                host
            );
        }
        // Hex-looking words without digits are ordinary names.
        assert!(net.check_host_access("cafe.example.com"));
    }

    #[test]
    fn test_public_ip_follows_policy() {
        assert!(control(true, &[], &[]).check_host_access("93.184.216.34"));
        assert!(!control(false, &[], &[]).check_host_access("93.184.216.34"));
    }

    #[test]
    fn test_wildcard_is_anchored() {
        let net = control(false, &["*.example.com"], &[]);
        assert!(net.check_host_access("api.example.com"));
        assert!(net.check_host_access("a.b.example.com"));
        assert!(!net.check_host_access("example.com"));
        assert!(!net.check_host_access("evil-example.com"));
        assert!(!net.check_host_access("example.com.evil.org"));
    }

    #[test]
    fn test_deny_beats_allow() {
        let net = control(true, &["*.example.com"], &["bad.example.com"]);
        assert!(!net.check_host_access("bad.example.com"));
        assert_eq!(
            net.evaluate("bad.example.com").reason,
            Some(NetDenyReason::DeniedHost)
        );
        assert!(net.check_host_access("good.example.com"));
    }

    #[test]
    fn test_default_applies_when_unmatched() {
        assert!(control(true, &[], &[]).check_host_access("rust-lang.org"));
        let decision = control(false, &[], &[]).evaluate("rust-lang.org");
        assert_eq!(decision.reason, Some(NetDenyReason::DefaultDeny));
    }

    #[test]
    fn test_host_normalized() {
        let net = control(false, &["Example.COM"], &[]);
        let decision = net.evaluate("  EXAMPLE.com. ");
        assert!(decision.allowed);
        assert_eq!(decision.host, "example.com");
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        for pattern in ["", "*", "*.", "api.*.com", "**.example.com", "exa mple.com", "a..b"] {
            assert!(HostPattern::parse(pattern).is_err(), "{:?} should be rejected", pattern);
        }
        assert_eq!(
            HostPattern::parse("*.Example.com").unwrap(),
            HostPattern::Wildcard("example.com".to_string())
        );
    }

    #[test]
    fn test_pattern_serde_roundtrip_through_string() {
        let json = serde_json::to_string(&HostPattern::parse("*.example.com").unwrap()).unwrap();
        assert_eq!(json, "\"*.example.com\"");
        assert!(serde_json::from_str::<HostPattern>("\"a.*.com\"").is_err());
    }
}
