//! Per-connection handling.
//!
//! A connection moves through read → parse → route → connect →
//! acknowledge/forward → relay. HTTP error responses are only written while
//! the client is still waiting for an answer to its request head; once a
//! tunnel is acknowledged or relaying starts, failures just close both
//! sockets.

use crate::audit::{self, RequestMode};
use crate::config::EngineSettings;
use crate::error::Result;
use crate::relay;
use crate::request::{self, RequestTarget};
use crate::snapshot::{ConfigSnapshot, Decision};
use crate::upstream;
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitRequest,
    ParseTarget,
    MatchRoute,
    Connecting,
    /// Writing a plain request head upstream; the client has seen nothing yet.
    Forwarding,
    Acknowledge,
    Relaying,
}

impl Stage {
    /// Whether the client can still receive an HTTP error response.
    fn can_respond(self) -> bool {
        !matches!(self, Stage::Acknowledge | Stage::Relaying)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::AwaitRequest => "await-request",
            Stage::ParseTarget => "parse-target",
            Stage::MatchRoute => "match-route",
            Stage::Connecting => "connecting",
            Stage::Forwarding => "forwarding",
            Stage::Acknowledge => "acknowledge",
            Stage::Relaying => "relaying",
        };
        f.write_str(name)
    }
}

/// Serve one client connection to completion.
///
/// `snapshot` is loaded by the caller once per connection. Both sockets are
/// closed when this returns, whatever the outcome.
pub async fn handle_connection(
    mut client: TcpStream,
    snapshot: Arc<ConfigSnapshot>,
    settings: Arc<EngineSettings>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stage = Stage::AwaitRequest;
    let result = serve(&mut client, &snapshot, &settings, &cancel, &mut stage).await;

    if let Err(ref e) = result {
        debug!("Connection failed during {}: {}", stage, e);
        if stage.can_respond() {
            if let Some(status) = e.status_code() {
                let _ = send_error(&mut client, status).await;
            }
        }
    }
    let _ = client.shutdown().await;
    result
}

async fn serve(
    client: &mut TcpStream,
    snapshot: &ConfigSnapshot,
    settings: &EngineSettings,
    cancel: &CancellationToken,
    stage: &mut Stage,
) -> Result<()> {
    let raw = match timeout(settings.request_timeout(), request::read_head(&mut *client)).await {
        Err(_) => {
            debug!("No request within {:?}, closing", settings.request_timeout());
            return Ok(());
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(raw))) => raw,
        Ok(Err(e)) => return Err(e),
    };

    *stage = Stage::ParseTarget;
    let target = request::parse_target(&raw.head)?;
    let mode = RequestMode::from_connect(target.is_connect);
    debug!("{} {}:{}", target.method, target.host, target.port);

    *stage = Stage::MatchRoute;
    let decision = route(snapshot, &target, mode);

    *stage = Stage::Connecting;
    let (host, port) = (target.host.as_str(), target.port);
    let connected = match decision {
        Decision::Proxy(proxy) => upstream::connect_via_proxy(proxy, host, port, settings).await,
        _ => upstream::connect_direct(host, port, settings.direct_connect_timeout()).await,
    };
    let mut upstream = match connected {
        Ok(upstream) => upstream,
        Err(e) => {
            audit::log_failed(mode, &target.host, target.port, e.status_code(), &e.to_string());
            return Err(e);
        }
    };

    if target.is_connect {
        *stage = Stage::Acknowledge;
        client.write_all(CONNECT_ESTABLISHED).await?;
    } else {
        *stage = Stage::Forwarding;
        upstream.stream.write_all(&raw.into_bytes()).await?;
        *stage = Stage::Acknowledge;
    }
    if !upstream.pending.is_empty() {
        client.write_all(&upstream.pending).await?;
    }
    client.flush().await?;

    *stage = Stage::Relaying;
    let stats = relay::relay(client, &mut upstream.stream, settings.relay_idle(), cancel).await?;
    debug!(
        "Relay for {}:{} ended ({:?}): {} bytes up, {} bytes down",
        target.host, target.port, stats.end, stats.from_client, stats.from_upstream
    );
    Ok(())
}

/// Resolve and audit the route for `target`. Anything but a known proxy
/// goes direct.
fn route<'a>(
    snapshot: &'a ConfigSnapshot,
    target: &RequestTarget,
    mode: RequestMode,
) -> Decision<'a> {
    let (host, port) = (target.host.as_str(), target.port);
    let decision = snapshot.resolve(host, Some(port));
    match decision {
        Decision::Proxy(proxy) => audit::log_routed(mode, host, port, proxy.label(), true),
        Decision::UnknownProxy(id) => audit::log_unknown_proxy(mode, host, port, id),
        Decision::Direct => audit::log_routed(mode, host, port, "direct", true),
        Decision::NoMatch => audit::log_routed(mode, host, port, "direct", false),
    }
    decision
}

/// Write a bodiless error response.
async fn send_error(stream: &mut TcpStream, status: u16) -> Result<()> {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Error");
    let response = format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
