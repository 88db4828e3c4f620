//! Client request head: reading and target extraction.
//!
//! The head is read line by line through a `BufReader` up to the blank line.
//! Anything the reader buffered past the head (early body bytes, or a
//! pipelined request) is kept so a non-CONNECT request can be forwarded
//! byte-for-byte.

use crate::error::{ProxyError, Result};
use http::Uri;
use std::net::Ipv6Addr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Maximum size of a request head (request line plus headers).
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Bytes read from the client before any routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    /// Request line and headers, including the terminating blank line.
    pub head: Vec<u8>,
    /// Bytes the reader pulled in past the head.
    pub buffered: Vec<u8>,
}

impl RawRequest {
    /// Everything read from the client, in order.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = self.head;
        bytes.extend_from_slice(&self.buffered);
        bytes
    }
}

/// Where the client wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub method: String,
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    pub is_connect: bool,
}

/// Read a request head from `reader`.
///
/// Returns `Ok(None)` when the client closed before sending anything.
pub async fn read_head<R: AsyncRead + Unpin>(reader: R) -> Result<Option<RawRequest>> {
    let mut buf_reader = BufReader::new(reader);
    let mut head = Vec::new();

    loop {
        let remaining = MAX_HEADER_SIZE.saturating_sub(head.len());
        let mut line = Vec::new();
        // One byte over the limit is enough to know the head is too large.
        let n = (&mut buf_reader)
            .take(remaining as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::BadRequest(
                "client closed before end of request head".to_string(),
            ));
        }

        head.extend_from_slice(&line);
        if head.len() > MAX_HEADER_SIZE {
            return Err(ProxyError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE,
            });
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
        if !line.ends_with(b"\n") {
            return Err(ProxyError::BadRequest(
                "client closed before end of request head".to_string(),
            ));
        }
    }

    let buffered = buf_reader.buffer().to_vec();
    Ok(Some(RawRequest { head, buffered }))
}

/// Extract the destination from a request head.
///
/// `CONNECT host:port` gives tunnel mode with a default port of 443. Any
/// other method takes its target from the `Host` header, falling back to an
/// absolute request URL; the default port is 80, or 443 for `https` URLs.
pub fn parse_target(head: &[u8]) -> Result<RequestTarget> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines();
    let request_line = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("empty request line".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::BadRequest(format!(
            "malformed request line: {}",
            request_line
        )));
    };
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::BadRequest(format!(
            "malformed request line: {}",
            request_line
        )));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(uri, 443)?;
        return Ok(RequestTarget {
            method: method.to_string(),
            host,
            port,
            is_connect: true,
        });
    }

    let parsed_uri = uri.parse::<Uri>().ok();
    let default_port = match parsed_uri.as_ref().and_then(Uri::scheme_str) {
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => 443,
        _ => 80,
    };

    let host_header = lines
        .take_while(|l| !l.trim().is_empty())
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim())
        .filter(|v| !v.is_empty());

    let (host, port) = if let Some(value) = host_header {
        split_authority(value, default_port)?
    } else {
        let authority = parsed_uri
            .as_ref()
            .and_then(Uri::authority)
            .ok_or_else(|| ProxyError::BadRequest("no Host header or absolute URL".to_string()))?;
        split_authority(authority.as_str(), default_port)?
    };

    Ok(RequestTarget {
        method: method.to_string(),
        host,
        port,
        is_connect: false,
    })
}

/// Split `host[:port]`, `[v6][:port]` or a bare IPv6 literal.
fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let bad = || ProxyError::BadRequest(format!("invalid authority: {}", authority));
    // Drop userinfo if a client put credentials in the URL.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        host.parse::<Ipv6Addr>().map_err(|_| bad())?;
        match tail {
            "" => (host, None),
            _ => (host, Some(tail.strip_prefix(':').ok_or_else(bad)?)),
        }
    } else if authority.parse::<Ipv6Addr>().is_ok() {
        (authority, None)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(bad());
    }
    let port = match port {
        Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(bad)?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}
