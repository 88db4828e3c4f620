//! Engine: listener lifecycle, configuration swaps, proxy tests and events.
//!
//! The engine is the only object the surrounding application talks to. It
//! owns the current [`ConfigSnapshot`] behind an `ArcSwap`, so configuration
//! updates never block or disturb connections already in flight, and it
//! reports lifecycle changes and proxy test results on a broadcast channel.

use crate::config::{EngineSettings, ProxyDescriptor, ProxyStatus, RuleDescriptor};
use crate::error::{ProxyError, Result};
use crate::matcher::SkippedRule;
use crate::probe;
use crate::server::{self, ListenerHandle};
use crate::snapshot::ConfigSnapshot;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait after spawning the accept loop before declaring the engine active.
const STARTUP_CHECK: Duration = Duration::from_millis(100);

/// Upper bound on waiting for the accept loop to exit on stop.
const STOP_WAIT: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Inactive,
    Starting,
    Active,
    Stopping,
    Error,
    /// Transient: the active profile changed while running.
    Switching,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Inactive => "inactive",
            EngineState::Starting => "starting",
            EngineState::Active => "active",
            EngineState::Stopping => "stopping",
            EngineState::Error => "error",
            EngineState::Switching => "switching",
        };
        f.write_str(name)
    }
}

/// Notifications for the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StatusChanged(EngineState),
    ErrorOccurred(String),
    ProxyTestResult { proxy_id: String, ok: bool },
}

struct Inner {
    settings: Arc<EngineSettings>,
    snapshot: Arc<ArcSwap<ConfigSnapshot>>,
    /// Serializes lifecycle transitions.
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
    state: Mutex<EngineState>,
    proxy_status: Mutex<HashMap<String, ProxyStatus>>,
    events: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl Inner {
    fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(EngineState::Error)
    }

    fn set_state(&self, next: EngineState) {
        let changed = match self.state.lock() {
            Ok(mut state) if *state != next => {
                *state = next;
                true
            }
            _ => false,
        };
        if changed {
            info!("Engine state: {}", next);
            self.emit(EngineEvent::StatusChanged(next));
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fail(&self, message: String) {
        warn!("Engine error: {}", message);
        self.set_state(EngineState::Error);
        self.emit(EngineEvent::ErrorOccurred(message));
    }

    fn record_status(&self, proxy_id: &str, status: ProxyStatus) {
        if let Ok(mut map) = self.proxy_status.lock() {
            map.insert(proxy_id.to_string(), status);
        }
    }
}

/// The proxy engine.
///
/// Dropping the engine stops the listener and cancels every relay still
/// running.
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    #[must_use]
    pub fn new(settings: EngineSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings: Arc::new(settings),
                snapshot: Arc::new(ArcSwap::from_pointee(ConfigSnapshot::default())),
                listener: tokio::sync::Mutex::new(None),
                state: Mutex::new(EngineState::Inactive),
                proxy_status: Mutex::new(HashMap::new()),
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// The configuration new connections will see.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.inner.snapshot.load_full()
    }

    /// Address the listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .await
            .as_ref()
            .map(ListenerHandle::local_addr)
    }

    /// Most recent test result for `proxy_id`.
    #[must_use]
    pub fn proxy_status(&self, proxy_id: &str) -> ProxyStatus {
        self.inner
            .proxy_status
            .lock()
            .ok()
            .and_then(|map| map.get(proxy_id).copied())
            .unwrap_or_default()
    }

    /// Bind and start accepting connections.
    ///
    /// Does nothing if the engine is already active. A bind failure, or an
    /// accept loop that dies during the startup check, leaves the engine in
    /// [`EngineState::Error`].
    pub async fn start(&self) -> Result<()> {
        let mut listener = self.inner.listener.lock().await;
        if listener.as_ref().is_some_and(ListenerHandle::is_running)
            && self.state() == EngineState::Active
        {
            return Ok(());
        }
        // A dead listener from an earlier run is discarded.
        if let Some(stale) = listener.take() {
            stale.shutdown(STOP_WAIT).await;
        }

        self.inner.set_state(EngineState::Starting);
        let handle = match server::start(
            Arc::clone(&self.inner.settings),
            Arc::clone(&self.inner.snapshot),
            self.inner.cancel.clone(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.fail(e.to_string());
                return Err(e);
            }
        };

        tokio::time::sleep(STARTUP_CHECK).await;
        if !handle.is_running() {
            let err = ProxyError::Bind {
                addr: handle.local_addr().to_string(),
                source: io::Error::other("accept loop exited during startup"),
            };
            self.inner.fail(err.to_string());
            return Err(err);
        }

        *listener = Some(handle);
        self.inner.set_state(EngineState::Active);
        Ok(())
    }

    /// Stop accepting connections. Always ends in [`EngineState::Inactive`].
    ///
    /// Connections already being served are left to finish.
    pub async fn stop(&self) {
        let mut listener = self.inner.listener.lock().await;
        if let Some(handle) = listener.take() {
            self.inner.set_state(EngineState::Stopping);
            handle.shutdown(STOP_WAIT).await;
        }
        self.inner.set_state(EngineState::Inactive);
    }

    /// Replace the configuration used by new connections.
    ///
    /// Rules are filtered by `active_profile` and compiled before the swap;
    /// malformed rules are logged and returned. Changing the profile while
    /// active emits a transient [`EngineState::Switching`].
    pub async fn update_config(
        &self,
        rules: &[RuleDescriptor],
        proxies: &[ProxyDescriptor],
        active_profile: Option<String>,
    ) -> Vec<SkippedRule> {
        let _lifecycle = self.inner.listener.lock().await;
        let (snapshot, skipped) = ConfigSnapshot::build(rules, proxies, active_profile);
        for rule in &skipped {
            warn!("Skipping rule {}: {}", rule.id, rule.reason);
        }

        let previous = self.inner.snapshot.load();
        let switching = self.state() == EngineState::Active
            && previous.active_profile() != snapshot.active_profile();
        info!(
            "Configuration updated: {} rules ({} compiled), {} proxies, profile {}",
            snapshot.rules().len(),
            snapshot.compiled_len(),
            proxies.len(),
            snapshot.active_profile().unwrap_or("<none>")
        );

        if let Ok(mut statuses) = self.inner.proxy_status.lock() {
            statuses.retain(|id, _| snapshot.proxy(id).is_some());
        }

        if switching {
            self.inner.set_state(EngineState::Switching);
        }
        self.inner.snapshot.store(Arc::new(snapshot));
        if switching {
            self.inner.set_state(EngineState::Active);
        }
        skipped
    }

    /// Test one proxy in the background.
    ///
    /// The result is stored as the proxy's status and emitted as
    /// [`EngineEvent::ProxyTestResult`]. An unknown id yields `false`.
    pub fn test_proxy(&self, proxy_id: &str) -> JoinHandle<bool> {
        let inner = Arc::clone(&self.inner);
        let proxy = self.snapshot().proxy(proxy_id).cloned();
        let proxy_id = proxy_id.to_string();

        tokio::spawn(async move {
            let ok = match proxy {
                None => {
                    warn!("Cannot test unknown proxy {}", proxy_id);
                    false
                }
                Some(proxy) => match probe::probe(&proxy, &inner.settings).await {
                    Ok(()) => {
                        info!("Proxy {} is working", proxy.label());
                        true
                    }
                    Err(e) => {
                        warn!("Proxy {} failed its test: {}", proxy.label(), e);
                        false
                    }
                },
            };
            let status = if ok {
                ProxyStatus::Active
            } else {
                ProxyStatus::Error
            };
            inner.record_status(&proxy_id, status);
            inner.emit(EngineEvent::ProxyTestResult { proxy_id, ok });
            ok
        })
    }

    /// Test every configured proxy concurrently.
    pub fn test_all_proxies(&self) -> Vec<(String, JoinHandle<bool>)> {
        self.snapshot()
            .proxies()
            .into_iter()
            .map(|p| (p.id.clone(), self.test_proxy(&p.id)))
            .collect()
    }

    /// Detect an accept loop that died while the engine believed it was
    /// active; moves the engine to [`EngineState::Error`] if so.
    pub async fn check_health(&self) -> EngineState {
        let listener = self.inner.listener.lock().await;
        if self.state() == EngineState::Active
            && !listener.as_ref().is_some_and(ListenerHandle::is_running)
        {
            self.inner
                .fail("proxy listener stopped unexpectedly".to_string());
        }
        self.state()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ProxyKind;
    use crate::snapshot::Decision;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_engine() -> Engine {
        Engine::new(EngineSettings {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            request_timeout_secs: 1,
            probe_timeout_secs: 2,
            ..EngineSettings::default()
        })
    }

    fn rule(target: &str, proxy: Option<&str>, profile: Option<&str>) -> RuleDescriptor {
        RuleDescriptor {
            id: target.to_string(),
            target: target.to_string(),
            port: None,
            proxy_id: proxy.map(str::to_string),
            profile_id: profile.map(str::to_string),
            enabled: true,
        }
    }

    fn proxy(id: &str, kind: ProxyKind, port: u16) -> ProxyDescriptor {
        ProxyDescriptor {
            id: id.to_string(),
            name: String::new(),
            kind,
            address: "127.0.0.1".to_string(),
            port,
            requires_auth: false,
            username: None,
            password: None,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let engine = test_engine();
        let mut rx = engine.subscribe();
        assert_eq!(engine.state(), EngineState::Inactive);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Active);
        let addr = engine.local_addr().await.unwrap();
        assert!(addr.port() > 0);

        // Idempotent while active.
        engine.start().await.unwrap();
        assert_eq!(engine.local_addr().await, Some(addr));

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Inactive);
        assert!(engine.local_addr().await.is_none());

        assert_eq!(
            drain(&mut rx),
            vec![
                EngineEvent::StatusChanged(EngineState::Starting),
                EngineEvent::StatusChanged(EngineState::Active),
                EngineEvent::StatusChanged(EngineState::Stopping),
                EngineEvent::StatusChanged(EngineState::Inactive),
            ]
        );

        // Stopping again is harmless.
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[tokio::test]
    async fn test_bind_failure_enters_error_state() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let engine = Engine::new(EngineSettings {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: taken.local_addr().unwrap().port(),
            ..EngineSettings::default()
        });
        let mut rx = engine.subscribe();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert_eq!(engine.state(), EngineState::Error);

        let events = drain(&mut rx);
        assert!(events.contains(&EngineEvent::StatusChanged(EngineState::Error)));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::ErrorOccurred(_))));

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[tokio::test]
    async fn test_check_health_on_running_engine() {
        let engine = test_engine();
        engine.start().await.unwrap();
        assert_eq!(engine.check_health().await, EngineState::Active);
        engine.stop().await;
        assert_eq!(engine.check_health().await, EngineState::Inactive);
    }

    #[tokio::test]
    async fn test_update_config_keeps_loaded_snapshot_consistent() {
        let engine = test_engine();
        engine
            .update_config(&[rule("a.example", Some("p1"), None)], &[proxy("p1", ProxyKind::Http, 3128)], None)
            .await;
        let before = engine.snapshot();

        engine
            .update_config(&[rule("b.example", None, None)], &[], None)
            .await;

        // The old snapshot still agrees with itself.
        assert!(matches!(before.resolve("a.example", None), Decision::Proxy(p) if p.id == "p1"));
        assert!(matches!(before.resolve("b.example", None), Decision::NoMatch));

        let after = engine.snapshot();
        assert!(matches!(after.resolve("a.example", None), Decision::NoMatch));
        assert!(matches!(after.resolve("b.example", None), Decision::Direct));
        assert!(after.proxy("p1").is_none());
    }

    #[tokio::test]
    async fn test_update_config_reports_skipped_rules() {
        let engine = test_engine();
        let skipped = engine
            .update_config(&[rule("1.2.*.4", None, None), rule("fine.example", None, None)], &[], None)
            .await;
        assert_eq!(skipped.len(), 1);
        assert_eq!(engine.snapshot().compiled_len(), 1);
    }

    #[tokio::test]
    async fn test_profile_switch_while_active_emits_switching() {
        let engine = test_engine();
        engine
            .update_config(&[], &[], Some("work".to_string()))
            .await;
        engine.start().await.unwrap();
        let mut rx = engine.subscribe();

        engine
            .update_config(&[], &[], Some("home".to_string()))
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![
                EngineEvent::StatusChanged(EngineState::Switching),
                EngineEvent::StatusChanged(EngineState::Active),
            ]
        );

        // Same profile: no transition.
        engine
            .update_config(&[], &[], Some("home".to_string()))
            .await;
        assert!(drain(&mut rx).is_empty());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_config_swap_applies_to_new_connections() {
        let engine = test_engine();
        engine.start().await.unwrap();
        let addr = engine.local_addr().await.unwrap();

        // A rule pointing at a proxy port where nothing listens.
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        engine
            .update_config(
                &[rule("blocked.example", Some("dead"), None)],
                &[proxy("dead", ProxyKind::Http, dead_port)],
                None,
            )
            .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT blocked.example:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_test_proxy_unknown_id() {
        let engine = test_engine();
        let mut rx = engine.subscribe();
        assert!(!engine.test_proxy("nope").await.unwrap());
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::ProxyTestResult {
                proxy_id: "nope".to_string(),
                ok: false
            }
        );
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[tokio::test]
    async fn test_test_all_proxies_records_status() {
        let stub = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good_port = stub.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = stub.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
        });
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let engine = test_engine();
        engine
            .update_config(
                &[],
                &[
                    proxy("good", ProxyKind::Http, good_port),
                    proxy("bad", ProxyKind::Http, dead_port),
                    proxy("odd", ProxyKind::Other("FTP".to_string()), 21),
                ],
                None,
            )
            .await;
        assert_eq!(engine.proxy_status("good"), ProxyStatus::Unknown);

        let mut results = HashMap::new();
        for (id, handle) in engine.test_all_proxies() {
            results.insert(id, handle.await.unwrap());
        }
        assert_eq!(results.len(), 3);
        assert!(results["good"]);
        assert!(!results["bad"]);
        assert!(!results["odd"]);

        assert_eq!(engine.proxy_status("good"), ProxyStatus::Active);
        assert_eq!(engine.proxy_status("bad"), ProxyStatus::Error);
        assert_eq!(engine.state(), EngineState::Inactive);
    }

    #[tokio::test]
    async fn test_drop_cancels_relays() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let engine = test_engine();
        engine.start().await.unwrap();
        let addr = engine.local_addr().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo_port).as_bytes())
            .await
            .unwrap();
        let mut ack = [0u8; 39];
        client.read_exact(&mut ack).await.unwrap();

        drop(engine);
        // The relay closes the client side once cancelled.
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
        assert!(read.is_ok());
    }
}
