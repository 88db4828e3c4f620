//! Listener: TCP bind, accept loop and connection dispatch.
//!
//! Each accepted connection gets its own task, which loads the current
//! configuration snapshot once and hands everything to
//! [`handler::handle_connection`].

use crate::config::EngineSettings;
use crate::error::{ProxyError, Result};
use crate::handler;
use crate::snapshot::ConfigSnapshot;
use arc_swap::ArcSwap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by the accept loop and every connection task.
struct ListenerState {
    snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    settings: Arc<EngineSettings>,
    /// Cancels in-flight relays; owned by the engine.
    cancel: CancellationToken,
    active_connections: AtomicUsize,
}

/// Handle to a running listener.
///
/// Signalling shutdown stops accepting; connections already handed to a
/// task keep running.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting and wait up to `wait` for the accept loop to exit,
    /// aborting it if it overruns. Returns whether it exited on its own.
    pub async fn shutdown(self, wait: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        match tokio::time::timeout(wait, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Accept loop did not stop within {:?}, aborting", wait);
                task.abort();
                false
            }
        }
    }
}

/// Bind `settings.bind_addr:settings.port` and start accepting.
///
/// Port 0 asks the OS for a free port; the actual address is on the handle.
pub async fn start(
    settings: Arc<EngineSettings>,
    snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    cancel: CancellationToken,
) -> Result<ListenerHandle> {
    let bind_addr = SocketAddr::new(settings.bind_addr, settings.port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;
    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;

    info!("Proxy listening on {}", local_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ListenerState {
        snapshot,
        settings,
        cancel,
        active_connections: AtomicUsize::new(0),
    });
    let task = tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(ListenerHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ListenerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let max = state.settings.max_connections;
                        if max > 0 {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= max {
                                warn!("Connection limit reached ({}/{}), dropping {}", current, max, addr);
                                drop(stream);
                                continue;
                            }
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let snapshot = state.snapshot.load_full();
                            let result = handler::handle_connection(
                                stream,
                                snapshot,
                                Arc::clone(&state.settings),
                                state.cancel.clone(),
                            )
                            .await;
                            if let Err(e) = result {
                                debug!("Connection from {} ended with error: {}", addr, e);
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped handle counts as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy listener shutting down");
                    return;
                }
            }
        }
    }
}
