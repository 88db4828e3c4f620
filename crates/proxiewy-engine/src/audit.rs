//! Audit logging for routing decisions.
//!
//! One structured `tracing` event per routed request. Credentials and
//! request contents are never included.

use tracing::{info, warn};

/// How the client asked to be proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// `CONNECT` tunnel
    Connect,
    /// Plain HTTP request forwarded verbatim
    Forward,
}

impl RequestMode {
    #[must_use]
    pub fn from_connect(is_connect: bool) -> Self {
        if is_connect {
            RequestMode::Connect
        } else {
            RequestMode::Forward
        }
    }
}

impl std::fmt::Display for RequestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestMode::Connect => write!(f, "connect"),
            RequestMode::Forward => write!(f, "forward"),
        }
    }
}

/// Log where a request is being sent. `via` is `direct` or a proxy label.
pub fn log_routed(mode: RequestMode, host: &str, port: u16, via: &str, matched: bool) {
    info!(
        target: "proxiewy_engine::audit",
        mode = %mode,
        host = host,
        port = port,
        via = via,
        matched = matched,
        "request routed"
    );
}

/// Log a rule that names a proxy id missing from the proxy table.
pub fn log_unknown_proxy(mode: RequestMode, host: &str, port: u16, proxy_id: &str) {
    warn!(
        target: "proxiewy_engine::audit",
        mode = %mode,
        host = host,
        port = port,
        proxy_id = proxy_id,
        "rule names unknown proxy, routing direct"
    );
}

/// Log a request that failed before relaying started.
pub fn log_failed(mode: RequestMode, host: &str, port: u16, status: Option<u16>, reason: &str) {
    info!(
        target: "proxiewy_engine::audit",
        mode = %mode,
        host = host,
        port = port,
        status = status,
        reason = reason,
        "request failed"
    );
}
