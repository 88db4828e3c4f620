//! Bidirectional byte relay between a client and its upstream.

use crate::error::{ProxyError, Result};
use futures_util::FutureExt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read size per direction.
const RELAY_BUF_SIZE: usize = 8 * 1024;

/// Why a relay stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    Cancelled,
}

/// Byte counters for a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub from_client: u64,
    pub from_upstream: u64,
    pub end: RelayEnd,
}

enum Liveness {
    Alive,
    Closed,
}

/// Pump bytes both ways until one side closes, a socket errors, or `cancel`
/// fires.
///
/// Every `idle` without traffic, both sockets are peeked without blocking
/// to notice a half-dead peer. Both sockets are shut down before returning.
pub async fn relay(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    idle: Duration,
    cancel: &CancellationToken,
) -> Result<RelayStats> {
    let result = pump(client, upstream, idle, cancel).await;
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    result
}

async fn pump(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    idle: Duration,
    cancel: &CancellationToken,
) -> Result<RelayStats> {
    let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut upstream_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut from_client = 0u64;
    let mut from_upstream = 0u64;

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break RelayEnd::Cancelled,
            res = client.read(&mut client_buf) => {
                let n = res.map_err(ProxyError::Relay)?;
                if n == 0 {
                    break RelayEnd::ClientClosed;
                }
                upstream.write_all(&client_buf[..n]).await.map_err(ProxyError::Relay)?;
                from_client += n as u64;
            }
            res = upstream.read(&mut upstream_buf) => {
                let n = res.map_err(ProxyError::Relay)?;
                if n == 0 {
                    break RelayEnd::UpstreamClosed;
                }
                client.write_all(&upstream_buf[..n]).await.map_err(ProxyError::Relay)?;
                from_upstream += n as u64;
            }
            _ = tokio::time::sleep(idle) => {
                if let Liveness::Closed = peek_liveness(client)? {
                    break RelayEnd::ClientClosed;
                }
                if let Liveness::Closed = peek_liveness(upstream)? {
                    break RelayEnd::UpstreamClosed;
                }
                debug!("Relay idle for {:?}, both sides alive", idle);
            }
        }
    };

    Ok(RelayStats {
        from_client,
        from_upstream,
        end,
    })
}

/// Non-blocking peek: a pending read means the socket is still open.
fn peek_liveness(stream: &TcpStream) -> Result<Liveness> {
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).now_or_never() {
        None => Ok(Liveness::Alive),
        Some(Ok(0)) => Ok(Liveness::Closed),
        Some(Ok(_)) => Ok(Liveness::Alive),
        Some(Err(e)) => Err(ProxyError::Relay(e)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A connected loopback pair: (our end, their end).
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ours, theirs) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (ours.unwrap(), theirs.unwrap().0)
    }

    #[tokio::test]
    async fn test_relays_both_directions_until_client_closes() {
        let (mut client_side, mut client_peer) = socket_pair().await;
        let (mut upstream_side, mut upstream_peer) = socket_pair().await;
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(async move {
            relay(
                &mut client_side,
                &mut upstream_side,
                Duration::from_secs(15),
                &cancel,
            )
            .await
        });

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.from_client, 4);
        assert_eq!(stats.from_upstream, 5);
        assert_eq!(stats.end, RelayEnd::ClientClosed);

        // Upstream sees EOF after the relay shut its side down.
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_ends_relay() {
        let (mut client_side, _client_peer) = socket_pair().await;
        let (mut upstream_side, _upstream_peer) = socket_pair().await;
        let cancel = CancellationToken::new();
        let child = cancel.clone();

        let relay_task = tokio::spawn(async move {
            relay(
                &mut client_side,
                &mut upstream_side,
                Duration::from_secs(15),
                &child,
            )
            .await
        });

        cancel.cancel();
        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.end, RelayEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_upstream_close_ends_relay() {
        let (mut client_side, mut client_peer) = socket_pair().await;
        let (mut upstream_side, mut upstream_peer) = socket_pair().await;
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(async move {
            relay(
                &mut client_side,
                &mut upstream_side,
                Duration::from_millis(50),
                &cancel,
            )
            .await
        });

        // Let a few idle ticks pass with both sides open.
        tokio::time::sleep(Duration::from_millis(200)).await;
        upstream_peer.write_all(b"bye").await.unwrap();
        drop(upstream_peer);

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.end, RelayEnd::UpstreamClosed);
        assert_eq!(stats.from_upstream, 3);

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }
}
