//! Upstream connections: direct, or chained through a configured proxy.
//!
//! HTTP and HTTPS proxies are driven with `CONNECT host:port` (the proxy
//! itself is always spoken to in plaintext); SOCKS5 proxies go through
//! `tokio-socks` on a socket we have already connected, so the connect
//! timeout and the handshake are bounded separately.
//!
//! Every failure path drops the socket it opened before returning.

use crate::config::{format_authority, EngineSettings, ProxyDescriptor, ProxyKind};
use crate::error::{ProxyError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Upper bound on a single CONNECT response line.
const MAX_RESPONSE_LINE: u64 = 8 * 1024;

/// Upper bound on a drained error body.
const MAX_DRAIN_BYTES: u64 = 1024 * 1024;

/// A connected upstream socket.
#[derive(Debug)]
pub struct Upstream {
    pub stream: TcpStream,
    /// Bytes an upstream proxy sent past its CONNECT response head. They
    /// belong to the tunnelled connection and go to the client first.
    pub pending: Vec<u8>,
}

impl Upstream {
    fn bare(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }
}

/// Open a TCP connection to `host:port`, trying each resolved address.
///
/// DNS failure, timeout and refusal surface as distinct errors.
pub async fn connect_direct(host: &str, port: u16, connect_timeout: Duration) -> Result<Upstream> {
    let target = format_authority(host, port);
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::Dns {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ProxyError::Dns {
            host: host.to_string(),
            reason: "no addresses returned".to_string(),
        });
    }

    dial_each(&addrs, &target, connect_timeout, TcpStream::connect)
        .await
        .map(Upstream::bare)
}

/// Try `addrs` in order until one connects. `connect_timeout` bounds the
/// whole sequence, not each attempt.
async fn dial_each<F, Fut>(
    addrs: &[SocketAddr],
    target: &str,
    connect_timeout: Duration,
    mut dial: F,
) -> Result<TcpStream>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<TcpStream>>,
{
    let mut timed_out = false;
    let mut last_err = None;
    let attempts = async {
        for addr in addrs {
            match dial(*addr).await {
                Ok(stream) => {
                    debug!("Connected to {} via {}", target, addr);
                    return Some(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    timed_out |= e.kind() == io::ErrorKind::TimedOut;
                    last_err = Some(e.to_string());
                }
            }
        }
        None
    };

    let outcome = timeout(connect_timeout, attempts).await;
    match outcome {
        Ok(Some(stream)) => return Ok(stream),
        Ok(None) => {}
        Err(_) => {
            debug!("Connect to {} timed out after {:?}", target, connect_timeout);
            timed_out = true;
        }
    }

    match last_err {
        Some(reason) if !timed_out => Err(ProxyError::ConnectionRefused {
            target: target.to_string(),
            reason,
        }),
        _ => Err(ProxyError::ConnectTimeout {
            target: target.to_string(),
        }),
    }
}

/// Open a tunnel to `host:port` through `proxy`.
pub async fn connect_via_proxy(
    proxy: &ProxyDescriptor,
    host: &str,
    port: u16,
    settings: &EngineSettings,
) -> Result<Upstream> {
    match &proxy.kind {
        ProxyKind::Http | ProxyKind::Https => {
            let stream = connect_proxy_socket(proxy, settings.proxy_connect_timeout()).await?;
            http_connect(proxy, stream, host, port, settings.handshake_read_timeout()).await
        }
        ProxyKind::Socks5 => {
            let stream = connect_proxy_socket(proxy, settings.proxy_connect_timeout()).await?;
            let handshake = socks5_connect(proxy, stream, host, port);
            match timeout(settings.handshake_read_timeout(), handshake).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::Socks {
                    proxy: proxy.label().to_string(),
                    reason: "handshake timed out".to_string(),
                }),
            }
        }
        ProxyKind::Other(kind) => Err(ProxyError::UnsupportedProxyType(kind.clone())),
    }
}

/// TCP connection to the proxy endpoint itself.
pub(crate) async fn connect_proxy_socket(
    proxy: &ProxyDescriptor,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let host = proxy.address.trim_start_matches('[').trim_end_matches(']');
    connect_direct(host, proxy.port, connect_timeout)
        .await
        .map(|upstream| upstream.stream)
}

/// `Proxy-Authorization` header value, when credentials are configured.
pub(crate) fn basic_auth(proxy: &ProxyDescriptor) -> Option<String> {
    proxy.credentials().map(|(user, pass)| {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
    })
}

async fn http_connect(
    proxy: &ProxyDescriptor,
    mut stream: TcpStream,
    host: &str,
    port: u16,
    read_timeout: Duration,
) -> Result<Upstream> {
    let authority = format_authority(host, port);
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n"
    );
    if let Some(auth) = basic_auth(proxy) {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    read_connect_response(&mut reader, proxy.label(), read_timeout).await?;
    let pending = reader.buffer().to_vec();
    Ok(Upstream {
        stream: reader.into_inner(),
        pending,
    })
}

/// Read a CONNECT response head and fail unless it is a 200.
///
/// On a non-200 status the response body is drained (Content-Length or
/// chunked) before the error is returned. Each line read has its own timeout.
pub(crate) async fn read_connect_response<R>(
    reader: &mut R,
    proxy: &str,
    read_timeout: Duration,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let protocol = |reason: String| ProxyError::UpstreamProxyProtocol {
        proxy: proxy.to_string(),
        reason,
    };

    let status_line = read_line(reader, proxy, read_timeout).await?;
    if status_line.is_empty() {
        return Err(protocol("connection closed before response".to_string()));
    }
    let status = parse_status_code(&status_line).map_err(protocol)?;

    let mut content_length = None;
    let mut chunked = false;
    loop {
        let line = read_line(reader, proxy, read_timeout).await?;
        if line.is_empty() {
            return Err(protocol("connection closed inside response headers".to_string()));
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<u64>().ok();
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.to_ascii_lowercase().contains("chunked");
            }
        }
    }

    if status == 200 {
        return Ok(());
    }

    debug!("Upstream proxy {} answered CONNECT with {}", proxy, status);
    if chunked {
        drain_chunked(reader, proxy, read_timeout).await?;
    } else if let Some(len) = content_length {
        drain_exact(reader, len.min(MAX_DRAIN_BYTES), proxy, read_timeout).await?;
    }

    if status == 407 {
        Err(ProxyError::UpstreamProxyAuthFailed {
            proxy: proxy.to_string(),
        })
    } else {
        Err(ProxyError::UpstreamProxyRefused {
            proxy: proxy.to_string(),
            status,
        })
    }
}

async fn read_line<R>(reader: &mut R, proxy: &str, read_timeout: Duration) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_RESPONSE_LINE);
    match timeout(read_timeout, limited.read_until(b'\n', &mut line)).await {
        Ok(result) => {
            result?;
            Ok(String::from_utf8_lossy(&line).into_owned())
        }
        Err(_) => Err(ProxyError::UpstreamProxyProtocol {
            proxy: proxy.to_string(),
            reason: "timed out reading response".to_string(),
        }),
    }
}

async fn drain_exact<R>(reader: &mut R, len: u64, proxy: &str, read_timeout: Duration) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = (&mut *reader).take(len);
    let mut sink = tokio::io::sink();
    match timeout(read_timeout, tokio::io::copy(&mut limited, &mut sink)).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(ProxyError::UpstreamProxyProtocol {
            proxy: proxy.to_string(),
            reason: "timed out draining response body".to_string(),
        }),
    }
}

async fn drain_chunked<R>(reader: &mut R, proxy: &str, read_timeout: Duration) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut drained = 0u64;
    loop {
        let size_line = read_line(reader, proxy, read_timeout).await?;
        if size_line.is_empty() {
            return Ok(());
        }
        let size_field = size_line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16).map_err(|_| {
            ProxyError::UpstreamProxyProtocol {
                proxy: proxy.to_string(),
                reason: format!("invalid chunk size: {}", size_field),
            }
        })?;

        if size == 0 {
            // Trailers, up to the blank line.
            loop {
                let line = read_line(reader, proxy, read_timeout).await?;
                if line.trim().is_empty() {
                    return Ok(());
                }
            }
        }

        drained += size;
        if drained > MAX_DRAIN_BYTES {
            return Ok(());
        }
        // Chunk data plus its CRLF.
        drain_exact(reader, size + 2, proxy, read_timeout).await?;
    }
}

/// Parse the status code out of `HTTP/1.x NNN reason`.
pub(crate) fn parse_status_code(line: &str) -> std::result::Result<u16, String> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| format!("invalid status code in response: {}", line.trim_end())),
        _ => Err(format!("malformed HTTP response: {}", line.trim_end())),
    }
}

async fn socks5_connect(
    proxy: &ProxyDescriptor,
    stream: TcpStream,
    host: &str,
    port: u16,
) -> Result<Upstream> {
    // Username/password auth needs both fields non-empty; anything less
    // negotiates no-auth.
    let result = match proxy.credentials() {
        Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
            Socks5Stream::connect_with_password_and_socket(stream, (host, port), user, pass).await
        }
        _ => Socks5Stream::connect_with_socket(stream, (host, port)).await,
    };

    match result {
        Ok(socks) => Ok(Upstream::bare(socks.into_inner())),
        Err(tokio_socks::Error::PasswordAuthFailure(_))
        | Err(tokio_socks::Error::NoAcceptableAuthMethods) => {
            Err(ProxyError::UpstreamProxyAuthFailed {
                proxy: proxy.label().to_string(),
            })
        }
        Err(e) => Err(ProxyError::Socks {
            proxy: proxy.label().to_string(),
            reason: e.to_string(),
        }),
    }
}
