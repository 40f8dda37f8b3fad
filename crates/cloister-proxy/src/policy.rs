//! Egress policy evaluator.
//!
//! Compiled once from the manifest's `egress` section and shared immutably
//! by every proxy task. Deny rules always take precedence over allow rules;
//! anything unmatched is denied.
//!
//! Pattern syntax per entry, with an optional `:port` suffix (an entry
//! without a port matches all ports):
//!
//! - exact DNS subdomain: `api.example.com`
//! - IP literal: `203.0.113.9`, `2001:db8::1`, `[2001:db8::1]:443`
//! - CIDR range: `10.0.0.0/8`
//! - `*.example.com` — exactly one additional label
//! - `**.example.com` — one or more additional labels (not the apex)
//! - `host` — the enclave's parent loopback address

use cloister_manifest::{is_dns1123_subdomain, Egress};
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid egress pattern {0:?}")]
    InvalidPattern(String),
    #[error("invalid port in egress pattern {0:?}")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
enum HostMatcher {
    Exact(String),
    Ip(IpAddr),
    Cidr(IpNet),
    /// `*.suffix`: exactly one label in front of the suffix.
    WildcardLabel(String),
    /// `**.suffix`: one or more labels in front of the suffix.
    AnySuffix(String),
    /// The literal `host`: the parent's loopback address.
    ParentHost,
    /// Matches every valid destination; only built by [`EgressPolicy::allow_all`].
    Any,
}

#[derive(Debug, Clone)]
struct Entry {
    matcher: HostMatcher,
    port: Option<u16>,
}

impl Entry {
    fn parse(raw: &str) -> Result<Self, PolicyError> {
        let (host_part, port) = split_port(raw)?;

        if host_part == "host" {
            return Ok(Entry {
                matcher: HostMatcher::ParentHost,
                port,
            });
        }
        if let Ok(ip) = host_part.parse::<IpAddr>() {
            return Ok(Entry {
                matcher: HostMatcher::Ip(ip),
                port,
            });
        }
        if host_part.contains('/') {
            let net = host_part
                .parse::<IpNet>()
                .map_err(|_| PolicyError::InvalidPattern(raw.to_string()))?;
            return Ok(Entry {
                matcher: HostMatcher::Cidr(net),
                port,
            });
        }
        if let Some(suffix) = host_part.strip_prefix("**.") {
            if !is_dns1123_subdomain(suffix) {
                return Err(PolicyError::InvalidPattern(raw.to_string()));
            }
            return Ok(Entry {
                matcher: HostMatcher::AnySuffix(suffix.to_ascii_lowercase()),
                port,
            });
        }
        if let Some(suffix) = host_part.strip_prefix("*.") {
            if !is_dns1123_subdomain(suffix) {
                return Err(PolicyError::InvalidPattern(raw.to_string()));
            }
            return Ok(Entry {
                matcher: HostMatcher::WildcardLabel(suffix.to_ascii_lowercase()),
                port,
            });
        }
        if is_dns1123_subdomain(&host_part.to_ascii_lowercase()) {
            return Ok(Entry {
                matcher: HostMatcher::Exact(host_part.to_ascii_lowercase()),
                port,
            });
        }
        Err(PolicyError::InvalidPattern(raw.to_string()))
    }

    fn matches(&self, host: &HostKind, port: u16, parent_host: IpAddr) -> bool {
        if let Some(p) = self.port {
            if p != port {
                return false;
            }
        }
        match (&self.matcher, host) {
            (HostMatcher::Exact(name), HostKind::Dns(host)) => name == host,
            (HostMatcher::Ip(ip), HostKind::Ip(host)) => ip == host,
            (HostMatcher::Cidr(net), HostKind::Ip(host)) => net.contains(host),
            (HostMatcher::WildcardLabel(suffix), HostKind::Dns(host)) => host
                .strip_suffix(suffix.as_str())
                .and_then(|head| head.strip_suffix('.'))
                .is_some_and(|head| !head.is_empty() && !head.contains('.')),
            (HostMatcher::AnySuffix(suffix), HostKind::Dns(host)) => host
                .strip_suffix(suffix.as_str())
                .and_then(|head| head.strip_suffix('.'))
                .is_some_and(|head| !head.is_empty()),
            (HostMatcher::ParentHost, HostKind::Ip(host)) => *host == parent_host,
            (HostMatcher::ParentHost, HostKind::Dns(host)) => host == "host",
            (HostMatcher::Any, _) => true,
            _ => false,
        }
    }
}

/// Split a trailing `:port`, leaving IPv6 literals intact.
fn split_port(raw: &str) -> Result<(String, Option<u16>), PolicyError> {
    if let Some(rest) = raw.strip_prefix('[') {
        // Bracketed IPv6: "[::1]" or "[::1]:443".
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| PolicyError::InvalidPattern(raw.to_string()))?;
        let port = match tail {
            "" => None,
            _ => {
                let digits = tail
                    .strip_prefix(':')
                    .ok_or_else(|| PolicyError::InvalidPattern(raw.to_string()))?;
                Some(parse_port(digits, raw)?)
            }
        };
        return Ok((host.to_string(), port));
    }

    // A lone colon separates host and port; more than one means a bare IPv6
    // literal with no port.
    if raw.bytes().filter(|b| *b == b':').count() == 1 {
        let (host, digits) = raw.split_once(':').expect("one colon");
        return Ok((host.to_string(), Some(parse_port(digits, raw)?)));
    }
    Ok((raw.to_string(), None))
}

fn parse_port(digits: &str, raw: &str) -> Result<u16, PolicyError> {
    let port: u16 = digits
        .parse()
        .map_err(|_| PolicyError::InvalidPort(raw.to_string()))?;
    if port == 0 {
        return Err(PolicyError::InvalidPort(raw.to_string()));
    }
    Ok(port)
}

enum HostKind {
    Ip(IpAddr),
    Dns(String),
}

#[derive(Debug, Default)]
struct CompiledSet {
    exact: Vec<Entry>,
    cidr: Vec<Entry>,
    wildcard: Vec<Entry>,
}

impl CompiledSet {
    fn compile(patterns: &[String]) -> Result<Self, PolicyError> {
        let mut set = CompiledSet::default();
        for raw in patterns {
            let entry = Entry::parse(raw)?;
            match entry.matcher {
                HostMatcher::Exact(_)
                | HostMatcher::Ip(_)
                | HostMatcher::ParentHost
                | HostMatcher::Any => set.exact.push(entry),
                HostMatcher::Cidr(_) => set.cidr.push(entry),
                HostMatcher::WildcardLabel(_) | HostMatcher::AnySuffix(_) => {
                    set.wildcard.push(entry)
                }
            }
        }
        Ok(set)
    }

    /// Exact matchers win over CIDR, which win over wildcards.
    fn matches(&self, host: &HostKind, port: u16, parent_host: IpAddr) -> bool {
        self.exact
            .iter()
            .chain(&self.cidr)
            .chain(&self.wildcard)
            .any(|e| e.matches(host, port, parent_host))
    }
}

#[derive(Debug)]
pub struct EgressPolicy {
    deny: CompiledSet,
    allow: CompiledSet,
    parent_host: IpAddr,
}

impl EgressPolicy {
    /// Compile the manifest's egress section. `parent_host` is the address
    /// the special `host` literal resolves to (the parent's loopback; always
    /// `127.0.0.1` on the simulation backend).
    pub fn compile(egress: &Egress, parent_host: IpAddr) -> Result<Self, PolicyError> {
        Ok(Self {
            deny: CompiledSet::compile(&egress.deny)?,
            allow: CompiledSet::compile(&egress.allow)?,
            parent_host,
        })
    }

    /// A policy that allows every valid destination. Used by the outside
    /// egress proxy, where enforcement has already happened inside the
    /// attested enclave.
    pub fn allow_all() -> Self {
        Self {
            deny: CompiledSet::default(),
            allow: CompiledSet {
                exact: vec![Entry {
                    matcher: HostMatcher::Any,
                    port: None,
                }],
                cidr: Vec::new(),
                wildcard: Vec::new(),
            },
            parent_host: IpAddr::from([127, 0, 0, 1]),
        }
    }

    /// Decide whether `(host, port)` may be dialed. Hosts that are neither a
    /// valid IP nor a DNS-1123 subdomain are denied outright.
    pub fn resolve(&self, host: &str, port: u16) -> Verdict {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let kind = if let Ok(ip) = host.parse::<IpAddr>() {
            HostKind::Ip(ip)
        } else if let Ok(ip) = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host.as_str())
            .parse::<IpAddr>()
        {
            HostKind::Ip(ip)
        } else if is_dns1123_subdomain(&host) {
            HostKind::Dns(host)
        } else {
            return Verdict::Deny;
        };

        if self.deny.matches(&kind, port, self.parent_host) {
            return Verdict::Deny;
        }
        if self.allow.matches(&kind, port, self.parent_host) {
            return Verdict::Allow;
        }
        Verdict::Deny
    }
}
