//! proxiewy CLI - headless runner for the proxy engine
//!
//! Loads a configuration file, hands it to the engine and either serves
//! until interrupted, tests the configured proxies, or explains a routing
//! decision.

mod cli;
mod config;
mod error;

use clap::Parser;
use cli::{Cli, Commands, RouteArgs};
use config::ConfigFile;
use error::{CliError, Result};
use proxiewy_engine::{Decision, Engine, EngineEvent, EngineState};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often `run` checks that the listener is still alive.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("proxiewy: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigFile::from_cli(&cli)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    rt.block_on(async move {
        let engine = Engine::new(config.settings.clone());
        engine
            .update_config(&config.rules, &config.proxies, config.active_profile.clone())
            .await;

        match cli.command {
            Commands::Run => run_proxy(&engine).await,
            Commands::Test => run_tests(&engine).await,
            Commands::Route(args) => {
                print_route(&engine, &args);
                Ok(())
            }
        }
    })
}

async fn run_proxy(engine: &Engine) -> Result<()> {
    let mut events = engine.subscribe();
    engine.start().await?;
    if let Some(addr) = engine.local_addr().await {
        println!("proxiewy listening on {}", addr);
    }

    let mut health = tokio::time::interval(HEALTH_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = health.tick() => {
                if engine.check_health().await == EngineState::Error {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::StatusChanged(state)) => info!("Status: {}", state),
                Ok(EngineEvent::ErrorOccurred(message)) => warn!("Engine error: {}", message),
                Ok(EngineEvent::ProxyTestResult { proxy_id, ok }) => {
                    info!("Proxy {} test: {}", proxy_id, if ok { "ok" } else { "failed" });
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} engine events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.stop().await;
    Ok(())
}

async fn run_tests(engine: &Engine) -> Result<()> {
    let snapshot = engine.snapshot();
    let handles = engine.test_all_proxies();
    let total = handles.len();
    if total == 0 {
        println!("No proxies configured");
        return Ok(());
    }

    let mut failed = 0;
    for (id, handle) in handles {
        let ok = handle.await.unwrap_or(false);
        let label = snapshot.proxy(&id).map_or(id.as_str(), |p| p.label());
        println!("{:<24} {}", label, if ok { "ok" } else { "FAILED" });
        if !ok {
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(CliError::ProxyTestsFailed { failed, total });
    }
    Ok(())
}

fn print_route(engine: &Engine, args: &RouteArgs) {
    let snapshot = engine.snapshot();
    let target = match args.port {
        Some(port) => format!("{}:{}", args.target, port),
        None => args.target.clone(),
    };
    match snapshot.resolve(&args.target, args.port) {
        Decision::Proxy(proxy) => println!(
            "{} -> {} ({} {})",
            target,
            proxy.label(),
            proxy.kind,
            proxy.endpoint()
        ),
        Decision::Direct => println!("{} -> direct (rule)", target),
        Decision::UnknownProxy(id) => {
            println!("{} -> direct (rule names unknown proxy {})", target, id);
        }
        Decision::NoMatch => println!("{} -> direct (no matching rule)", target),
    }
}
