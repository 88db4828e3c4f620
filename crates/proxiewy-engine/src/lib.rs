//! Rule-routed forward proxy engine.
//!
//! `proxiewy-engine` listens for HTTP proxy clients and routes each request,
//! by destination domain or IP, either directly or through one of several
//! upstream proxies:
//!
//! - **CONNECT tunnels** are acknowledged with `200 Connection Established`
//!   and relayed as opaque bytes (TLS is never terminated).
//! - **Plain HTTP requests** are forwarded byte-for-byte to the chosen
//!   upstream.
//! - **Upstream proxies** are HTTP/HTTPS (chained with `CONNECT`, optional
//!   Basic auth) or SOCKS5 (optional username/password).
//!
//! The [`Engine`] is the entry point: feed it rules and proxies with
//! [`Engine::update_config`], then [`Engine::start`] it and listen on
//! [`Engine::subscribe`] for status and proxy test events.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod matcher;
pub mod probe;
pub mod relay;
pub mod request;
pub mod server;
pub mod snapshot;
pub mod upstream;

pub use config::{
    EngineSettings, PortSpec, ProxyDescriptor, ProxyKind, ProxyStatus, RuleDescriptor,
    ALL_PROFILES,
};
pub use engine::{Engine, EngineEvent, EngineState};
pub use error::{ProxyError, Result};
pub use matcher::{Route, RuleMatcher, SkippedRule};
pub use snapshot::{ConfigSnapshot, Decision};
