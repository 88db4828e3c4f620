//! Error types for the proxiewy-engine crate.

use thiserror::Error;

/// Errors that can occur in the proxy engine.
///
/// Per-connection variants carry enough context to log; the client-facing
/// mapping lives in [`ProxyError::status_code`].
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("DNS resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("Connection to {target} timed out")]
    ConnectTimeout { target: String },

    #[error("Connection to {target} refused: {reason}")]
    ConnectionRefused { target: String, reason: String },

    #[error("Upstream proxy {proxy} rejected credentials (407)")]
    UpstreamProxyAuthFailed { proxy: String },

    #[error("Upstream proxy {proxy} refused CONNECT with status {status}")]
    UpstreamProxyRefused { proxy: String, status: u16 },

    #[error("Upstream proxy {proxy} sent a malformed response: {reason}")]
    UpstreamProxyProtocol { proxy: String, reason: String },

    #[error("SOCKS5 handshake with {proxy} failed: {reason}")]
    Socks { proxy: String, reason: String },

    #[error("Unsupported proxy type: {0}")]
    UnsupportedProxyType(String),

    #[error("Relay error: {0}")]
    Relay(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status to answer the client with, if any.
    ///
    /// `None` means the error is either not client-facing (bind, config)
    /// or happened on a channel that can no longer carry an HTTP response.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProxyError::BadRequest(_) => Some(400),
            ProxyError::HeaderTooLarge { .. } => Some(431),
            ProxyError::ConnectTimeout { .. } => Some(504),
            ProxyError::Dns { .. }
            | ProxyError::ConnectionRefused { .. }
            | ProxyError::UpstreamProxyAuthFailed { .. }
            | ProxyError::UpstreamProxyRefused { .. }
            | ProxyError::UpstreamProxyProtocol { .. }
            | ProxyError::Socks { .. }
            | ProxyError::UnsupportedProxyType(_) => Some(502),
            ProxyError::Io(_) => Some(500),
            ProxyError::Relay(_)
            | ProxyError::Bind { .. }
            | ProxyError::Config(_) => None,
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(ProxyError::BadRequest("x".into()).status_code(), Some(400));
        assert_eq!(
            ProxyError::ConnectTimeout {
                target: "a:1".into()
            }
            .status_code(),
            Some(504)
        );
        assert_eq!(
            ProxyError::UpstreamProxyAuthFailed {
                proxy: "corp".into()
            }
            .status_code(),
            Some(502)
        );
        assert_eq!(
            ProxyError::UnsupportedProxyType("FTP".into()).status_code(),
            Some(502)
        );
    }

    #[test]
    fn test_relay_errors_are_silent() {
        let err = ProxyError::Relay(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(err.status_code(), None);
    }
}
