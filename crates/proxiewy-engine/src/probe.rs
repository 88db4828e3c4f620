//! Proxy connectivity checks.
//!
//! HTTP and HTTPS proxies are asked to fetch the check URL (absolute-form
//! `GET`); any 2xx or 3xx answer counts as working. SOCKS5 proxies only need
//! to complete a CONNECT to the check URL's host.

use crate::config::{EngineSettings, ProxyDescriptor, ProxyKind};
use crate::error::{ProxyError, Result};
use crate::upstream;
use http::Uri;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

/// Check whether `proxy` can reach the configured check URL.
///
/// The whole check is bounded by `settings.probe_timeout()`.
pub async fn probe(proxy: &ProxyDescriptor, settings: &EngineSettings) -> Result<()> {
    let (url, host, port) = check_target(&settings.check_url)?;
    let check = async {
        match proxy.kind {
            ProxyKind::Http | ProxyKind::Https => probe_http(proxy, settings, &url, &host).await,
            ProxyKind::Socks5 => upstream::connect_via_proxy(proxy, &host, port, settings)
                .await
                .map(drop),
            ProxyKind::Other(ref kind) => Err(ProxyError::UnsupportedProxyType(kind.clone())),
        }
    };

    match timeout(settings.probe_timeout(), check).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::ConnectTimeout {
            target: proxy.endpoint(),
        }),
    }
}

/// Split the check URL into the absolute URL, host and port.
fn check_target(check_url: &str) -> Result<(String, String, u16)> {
    let uri = check_url
        .parse::<Uri>()
        .map_err(|e| ProxyError::Config(format!("invalid check URL {}: {}", check_url, e)))?;
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::Config(format!("check URL has no host: {}", check_url)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Ok((uri.to_string(), host, port))
}

async fn probe_http(
    proxy: &ProxyDescriptor,
    settings: &EngineSettings,
    url: &str,
    host: &str,
) -> Result<()> {
    let mut stream = upstream::connect_proxy_socket(proxy, settings.proxy_connect_timeout()).await?;

    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", url, host);
    if let Some(auth) = upstream::basic_auth(proxy) {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = upstream::parse_status_code(&status_line).map_err(|reason| {
        ProxyError::UpstreamProxyProtocol {
            proxy: proxy.label().to_string(),
            reason,
        }
    })?;

    match status {
        200..=399 => Ok(()),
        407 => Err(ProxyError::UpstreamProxyAuthFailed {
            proxy: proxy.label().to_string(),
        }),
        _ => Err(ProxyError::UpstreamProxyRefused {
            proxy: proxy.label().to_string(),
            status,
        }),
    }
}
