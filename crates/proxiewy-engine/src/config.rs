//! Engine configuration types.
//!
//! Defines the listener settings, the proxy table and the rule table that
//! the surrounding application hands to the engine. The engine only reads
//! these; persistence belongs to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

/// Profile id meaning "apply every rule regardless of its profile".
pub const ALL_PROFILES: &str = "__all__";

/// Listener and timeout settings for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Bind address (default: 0.0.0.0, all interfaces)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (default: 8080, 0 = OS-assigned)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for the client's request head.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds allowed for a direct upstream TCP connect.
    #[serde(default = "default_direct_connect_timeout")]
    pub direct_connect_timeout_secs: u64,

    /// Seconds allowed for connecting to an upstream proxy.
    #[serde(default = "default_proxy_connect_timeout")]
    pub proxy_connect_timeout_secs: u64,

    /// Seconds allowed for each line read of an upstream CONNECT response.
    #[serde(default = "default_handshake_read_timeout")]
    pub handshake_read_timeout_secs: u64,

    /// Relay idle interval after which both sockets are probed for liveness.
    #[serde(default = "default_relay_idle")]
    pub relay_idle_secs: u64,

    /// URL fetched through a proxy to test it.
    #[serde(default = "default_check_url")]
    pub check_url: String,

    /// Seconds allowed for one proxy test.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Maximum concurrent connections (0 = unlimited).
    #[serde(default)]
    pub max_connections: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            direct_connect_timeout_secs: default_direct_connect_timeout(),
            proxy_connect_timeout_secs: default_proxy_connect_timeout(),
            handshake_read_timeout_secs: default_handshake_read_timeout(),
            relay_idle_secs: default_relay_idle(),
            check_url: default_check_url(),
            probe_timeout_secs: default_probe_timeout(),
            max_connections: 0,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn direct_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_connect_timeout_secs)
    }

    #[must_use]
    pub fn proxy_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_connect_timeout_secs)
    }

    #[must_use]
    pub fn handshake_read_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_read_timeout_secs)
    }

    #[must_use]
    pub fn relay_idle(&self) -> Duration {
        Duration::from_secs(self.relay_idle_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    5
}

fn default_direct_connect_timeout() -> u64 {
    10
}

fn default_proxy_connect_timeout() -> u64 {
    15
}

fn default_handshake_read_timeout() -> u64 {
    10
}

fn default_relay_idle() -> u64 {
    15
}

fn default_check_url() -> String {
    "http://httpbin.org/ip".to_string()
}

fn default_probe_timeout() -> u64 {
    8
}

/// Upstream proxy protocol.
///
/// Unrecognised type strings are preserved in [`ProxyKind::Other`] so the
/// connector can reject them with a precise error instead of failing the
/// whole configuration load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
    Other(String),
}

impl From<String> for ProxyKind {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => ProxyKind::Http,
            "HTTPS" => ProxyKind::Https,
            "SOCKS5" => ProxyKind::Socks5,
            _ => ProxyKind::Other(s),
        }
    }
}

impl From<ProxyKind> for String {
    fn from(kind: ProxyKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Http => write!(f, "HTTP"),
            ProxyKind::Https => write!(f, "HTTPS"),
            ProxyKind::Socks5 => write!(f, "SOCKS5"),
            ProxyKind::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A configured upstream proxy.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ProxyKind,

    pub address: String,

    pub port: u16,

    #[serde(default)]
    pub requires_auth: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<Zeroizing<String>>,
}

impl ProxyDescriptor {
    /// Credentials to present upstream, if authentication is enabled.
    ///
    /// A missing password is sent as empty.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if !self.requires_auth {
            return None;
        }
        let user = self.username.as_deref()?;
        let pass = self.password.as_ref().map_or("", |p| p.as_str());
        Some((user, pass))
    }

    /// `host:port` of the proxy itself.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format_authority(&self.address, self.port)
    }

    /// Name for log lines, falling back to the id.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("requires_auth", &self.requires_auth)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Result of the most recent connectivity test of a proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    #[default]
    Unknown,
    Active,
    Error,
}

/// Port constraint of an IP rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortSpecRepr", into = "String")]
pub enum PortSpec {
    Single(u16),
    /// Inclusive range.
    Range(u16, u16),
}

impl PortSpec {
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortSpec::Single(p) => p == port,
            PortSpec::Range(start, end) => (start..=end).contains(&port),
        }
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {:?}", p))
        };
        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("port range {}-{} is reversed", start, end));
                }
                Ok(PortSpec::Range(start, end))
            }
            None => Ok(PortSpec::Single(parse(s)?)),
        }
    }
}

/// JSON form of a port spec: `443` or `"8000-9000"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortSpecRepr {
    Number(u16),
    Text(String),
}

impl TryFrom<PortSpecRepr> for PortSpec {
    type Error = String;

    fn try_from(repr: PortSpecRepr) -> Result<Self, Self::Error> {
        match repr {
            PortSpecRepr::Number(port) => Ok(PortSpec::Single(port)),
            PortSpecRepr::Text(s) => s.parse(),
        }
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{}", p),
            PortSpec::Range(start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

/// A routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDescriptor {
    pub id: String,

    /// Domain pattern (`example.com`, `*.example.com`) or IP literal,
    /// optionally with an inline port spec (`10.0.0.1:8000-9000`).
    pub target: String,

    /// Port spec for IP targets.
    #[serde(default)]
    pub port: Option<PortSpec>,

    /// Proxy to route through; `None` routes direct.
    #[serde(default)]
    pub proxy_id: Option<String>,

    /// Owning profile; `None` makes the rule global.
    #[serde(default)]
    pub profile_id: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Select the rules that apply under `active_profile`.
///
/// Global rules (no profile) always apply. With no active profile, or
/// [`ALL_PROFILES`], every rule applies.
#[must_use]
pub fn rules_for_profile(
    rules: &[RuleDescriptor],
    active_profile: Option<&str>,
) -> Vec<RuleDescriptor> {
    match active_profile {
        None | Some(ALL_PROFILES) => rules.to_vec(),
        Some(active) => rules
            .iter()
            .filter(|r| r.profile_id.as_deref().map_or(true, |p| p == active))
            .cloned()
            .collect(),
    }
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rule(id: &str, profile: Option<&str>) -> RuleDescriptor {
        RuleDescriptor {
            id: id.to_string(),
            target: format!("{}.example.com", id),
            port: None,
            proxy_id: None,
            profile_id: profile.map(str::to_string),
            enabled: true,
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.port, 8080);
        assert!(settings.bind_addr.is_unspecified());
        assert_eq!(settings.request_timeout(), Duration::from_secs(5));
        assert_eq!(settings.relay_idle(), Duration::from_secs(15));
        assert_eq!(settings.max_connections, 0);
    }

    #[test]
    fn test_settings_partial_json_uses_defaults() {
        let settings: EngineSettings = serde_json::from_str(r#"{"port": 9090}"#).unwrap();
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.proxy_connect_timeout_secs, 15);
        assert_eq!(settings.check_url, "http://httpbin.org/ip");
    }

    #[test]
    fn test_proxy_kind_parsing() {
        assert_eq!(ProxyKind::from("socks5".to_string()), ProxyKind::Socks5);
        assert_eq!(ProxyKind::from("HTTP".to_string()), ProxyKind::Http);
        assert_eq!(
            ProxyKind::from("FTP".to_string()),
            ProxyKind::Other("FTP".to_string())
        );
    }

    #[test]
    fn test_proxy_descriptor_from_json() {
        let proxy: ProxyDescriptor = serde_json::from_str(
            r#"{"id": "p1", "name": "corp", "type": "SOCKS5", "address": "10.1.1.1",
                "port": 1080, "requires_auth": true, "username": "bob", "password": "pw"}"#,
        )
        .unwrap();
        assert_eq!(proxy.kind, ProxyKind::Socks5);
        assert_eq!(proxy.credentials(), Some(("bob", "pw")));
        assert_eq!(proxy.endpoint(), "10.1.1.1:1080");
    }

    #[test]
    fn test_credentials_require_auth_flag() {
        let mut proxy: ProxyDescriptor = serde_json::from_str(
            r#"{"id": "p1", "type": "HTTP", "address": "proxy", "port": 3128,
                "username": "bob", "password": "pw"}"#,
        )
        .unwrap();
        assert_eq!(proxy.credentials(), None);
        proxy.requires_auth = true;
        proxy.password = None;
        assert_eq!(proxy.credentials(), Some(("bob", "")));
    }

    #[test]
    fn test_debug_redacts_password() {
        let proxy: ProxyDescriptor = serde_json::from_str(
            r#"{"id": "p1", "type": "HTTP", "address": "proxy", "port": 3128,
                "requires_auth": true, "username": "bob", "password": "hunter2"}"#,
        )
        .unwrap();
        let debug = format!("{:?}", proxy);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_port_spec_parsing() {
        assert_eq!("443".parse::<PortSpec>().unwrap(), PortSpec::Single(443));
        assert_eq!(
            "8000-9000".parse::<PortSpec>().unwrap(),
            PortSpec::Range(8000, 9000)
        );
        assert!("9000-8000".parse::<PortSpec>().is_err());
        assert!("http".parse::<PortSpec>().is_err());
        assert!(PortSpec::Range(10, 20).contains(20));
        assert!(!PortSpec::Single(10).contains(11));
    }

    #[test]
    fn test_rule_from_json_defaults() {
        let rule: RuleDescriptor =
            serde_json::from_str(r#"{"id": "r1", "target": "10.0.0.1", "port": "22-23"}"#)
                .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.port, Some(PortSpec::Range(22, 23)));
        assert!(rule.proxy_id.is_none());

        let rule: RuleDescriptor =
            serde_json::from_str(r#"{"id": "r2", "target": "10.0.0.1", "port": 443}"#).unwrap();
        assert_eq!(rule.port, Some(PortSpec::Single(443)));
    }

    #[test]
    fn test_rules_for_profile() {
        let rules = vec![rule("g", None), rule("work", Some("work")), rule("home", Some("home"))];

        let work = rules_for_profile(&rules, Some("work"));
        let ids: Vec<_> = work.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["g", "work"]);

        assert_eq!(rules_for_profile(&rules, None).len(), 3);
        assert_eq!(rules_for_profile(&rules, Some(ALL_PROFILES)).len(), 3);
    }

    #[test]
    fn test_format_authority_brackets_ipv6() {
        assert_eq!(format_authority("::1", 443), "[::1]:443");
        assert_eq!(format_authority("example.com", 80), "example.com:80");
    }
}
