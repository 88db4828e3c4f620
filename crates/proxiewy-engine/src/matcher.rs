//! Rule matching: target host (+port) to routing decision.
//!
//! Rules are compiled into three structures:
//!
//! - exact domains (lowercased) in a hash map
//! - IP literals, each with per-port, port-range and any-port entries
//! - wildcard domain patterns (`*`, `?`), sorted by length descending then
//!   alphabetically
//!
//! Domain lookups walk the suffixes of the name from most to least specific
//! (`a.b.c`, `b.c`, `c`). At each level the exact map is consulted first,
//! then the wildcard list against that suffix only. The first level that
//! produces any hit wins, so `*.a.com` beats `a.com` when matching `x.a.com`.

use crate::config::{PortSpec, RuleDescriptor};
use std::collections::HashMap;
use std::net::IpAddr;
use wildmatch::WildMatch;

/// Where a matched rule sends traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy(String),
}

impl Route {
    fn from_proxy_id(proxy_id: Option<&String>) -> Self {
        match proxy_id {
            Some(id) if !id.is_empty() => Route::Proxy(id.clone()),
            _ => Route::Direct,
        }
    }
}

/// A rule left out of the compiled table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRule {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
struct IpRules {
    ports: HashMap<u16, Route>,
    /// Inclusive ranges in registration order.
    ranges: Vec<(u16, u16, Route)>,
    any: Option<Route>,
}

impl IpRules {
    fn lookup(&self, port: Option<u16>) -> Option<&Route> {
        if let Some(port) = port {
            if let Some(route) = self.ports.get(&port) {
                return Some(route);
            }
            // Narrowest containing range; min_by_key keeps the first of equals.
            let range = self
                .ranges
                .iter()
                .filter(|(start, end, _)| PortSpec::Range(*start, *end).contains(port))
                .min_by_key(|(start, end, _)| end - start);
            if let Some((_, _, route)) = range {
                return Some(route);
            }
        }
        self.any.as_ref()
    }
}

#[derive(Debug)]
struct WildcardRule {
    pattern: String,
    matcher: WildMatch,
    route: Route,
}

/// Compiled, immutable rule table.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    exact: HashMap<String, Route>,
    ips: HashMap<IpAddr, IpRules>,
    wildcards: Vec<WildcardRule>,
}

impl RuleMatcher {
    /// Compile `rules` into a new table.
    ///
    /// Disabled rules are dropped silently. Malformed rules are dropped and
    /// returned so the caller can log them.
    #[must_use]
    pub fn build(rules: &[RuleDescriptor]) -> (Self, Vec<SkippedRule>) {
        let mut table = RuleMatcher::default();
        let mut skipped = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            let route = Route::from_proxy_id(rule.proxy_id.as_ref());
            match classify(rule) {
                Ok(Target::Ip(ip, ports)) => {
                    let entry = table.ips.entry(ip).or_default();
                    match ports {
                        Some(PortSpec::Single(port)) => {
                            entry.ports.insert(port, route);
                        }
                        Some(PortSpec::Range(start, end)) => entry.ranges.push((start, end, route)),
                        None => entry.any = Some(route),
                    }
                }
                Ok(Target::Exact(domain)) => {
                    table.exact.insert(domain, route);
                }
                Ok(Target::Wildcard(pattern)) => table.wildcards.push(WildcardRule {
                    matcher: WildMatch::new(&pattern),
                    pattern,
                    route,
                }),
                Err(reason) => skipped.push(SkippedRule {
                    id: rule.id.clone(),
                    reason,
                }),
            }
        }

        table.wildcards.sort_by(|a, b| {
            b.pattern
                .len()
                .cmp(&a.pattern.len())
                .then_with(|| a.pattern.cmp(&b.pattern))
        });

        (table, skipped)
    }

    /// Find the route for `target`, or `None` when no rule applies.
    #[must_use]
    pub fn find(&self, target: &str, port: Option<u16>) -> Option<&Route> {
        let target = target.trim();
        let unbracketed = target
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .unwrap_or(target);
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return self.ips.get(&ip)?.lookup(port);
        }

        let domain = target.trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return None;
        }

        let mut suffix = domain.as_str();
        loop {
            if let Some(route) = self.exact.get(suffix) {
                return Some(route);
            }
            if let Some(rule) = self.wildcards.iter().find(|w| w.matcher.matches(suffix)) {
                return Some(&rule.route);
            }
            match suffix.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => suffix = rest,
                _ => return None,
            }
        }
    }

    /// Number of compiled entries (exact domains, IP entries, wildcards).
    #[must_use]
    pub fn len(&self) -> usize {
        let ip_entries: usize = self
            .ips
            .values()
            .map(|r| r.ports.len() + r.ranges.len() + usize::from(r.any.is_some()))
            .sum();
        self.exact.len() + ip_entries + self.wildcards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Target {
    Ip(IpAddr, Option<PortSpec>),
    Exact(String),
    Wildcard(String),
}

fn classify(rule: &RuleDescriptor) -> Result<Target, String> {
    let raw = rule.target.trim();
    if raw.is_empty() {
        return Err("empty target".to_string());
    }

    if let Some((ip, inline)) = split_ip_target(raw)? {
        let ports = match (inline, rule.port) {
            (Some(a), Some(b)) if a != b => {
                return Err(format!("inline port {} conflicts with port {}", a, b))
            }
            (inline, port) => inline.or(port),
        };
        return Ok(Target::Ip(ip, ports));
    }

    let has_wildcard = raw.contains(&['*', '?'][..]);
    let ip_like = raw.chars().any(|c| c.is_ascii_digit())
        && raw.chars().all(|c| "0123456789.:*?[]".contains(c));
    if has_wildcard && ip_like {
        return Err(format!("wildcards are not allowed in IP literal {}", raw));
    }
    if raw.contains(':') {
        return Err(format!("domain target {} must not carry a port", raw));
    }
    if rule.port.is_some() {
        return Err(format!("port spec only applies to IP targets, not {}", raw));
    }

    let pattern = raw.trim_end_matches('.').to_ascii_lowercase();
    if has_wildcard {
        Ok(Target::Wildcard(pattern))
    } else {
        Ok(Target::Exact(pattern))
    }
}

/// Parse `ip`, `ip:ports`, `[v6]` or `[v6]:ports`.
///
/// `Ok(None)` means the target is not an IP literal at all.
fn split_ip_target(raw: &str) -> Result<Option<(IpAddr, Option<PortSpec>)>, String> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(Some((ip, None)));
    }

    let (host, ports) = if let Some(rest) = raw.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, "")) => (host, None),
            Some((host, tail)) => match tail.strip_prefix(':') {
                Some(ports) => (host, Some(ports)),
                None => return Ok(None),
            },
            None => return Ok(None),
        }
    } else {
        match raw.rsplit_once(':') {
            Some((host, ports)) if !host.contains(':') => (host, Some(ports)),
            _ => return Ok(None),
        }
    };

    let Ok(ip) = host.parse::<IpAddr>() else {
        return Ok(None);
    };
    let ports = ports.map(str::parse::<PortSpec>).transpose()?;
    Ok(Some((ip, ports)))
}
