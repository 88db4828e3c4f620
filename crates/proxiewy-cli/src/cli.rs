//! CLI argument definitions for proxiewy.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// proxiewy - rule-routed local forward proxy
///
/// Listens for HTTP proxy clients and sends each request directly or
/// through an upstream HTTP/SOCKS5 proxy, chosen per destination by rules.
#[derive(Parser, Debug)]
#[command(name = "proxiewy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON file with settings, proxies, rules and the active profile
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long, value_name = "IP", global = true)]
    pub bind: Option<IpAddr>,

    /// Override the listen port
    #[arg(long, short = 'p', value_name = "PORT", global = true)]
    pub port: Option<u16>,

    /// Override the active profile (`__all__` applies every rule)
    #[arg(long, value_name = "ID", global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy until interrupted
    #[command(after_help = "EXAMPLES:
    # Listen on the default port with rules from a file
    proxiewy --config proxiewy.json run

    # Local-only listener on another port
    proxiewy --config proxiewy.json --bind 127.0.0.1 --port 3128 run
")]
    Run,

    /// Test every configured upstream proxy
    Test,

    /// Show which route a destination would take
    Route(RouteArgs),
}

#[derive(clap::Args, Debug)]
pub struct RouteArgs {
    /// Domain or IP address
    pub target: String,

    /// Destination port (matters for IP rules with port specs)
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_overrides() {
        let cli = Cli::parse_from([
            "proxiewy",
            "--config",
            "rules.json",
            "--bind",
            "127.0.0.1",
            "--port",
            "3128",
            "run",
        ]);
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, Some(PathBuf::from("rules.json")));
        assert_eq!(cli.bind, Some(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(cli.port, Some(3128));
    }

    #[test]
    fn test_route_args() {
        let cli = Cli::parse_from(["proxiewy", "route", "10.0.0.1", "--port", "443"]);
        match cli.command {
            Commands::Route(args) => {
                assert_eq!(args.target, "10.0.0.1");
                assert_eq!(args.port, Some(443));
            }
            _ => panic!("Expected Route command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["proxiewy", "test", "--profile", "work"]);
        assert!(matches!(cli.command, Commands::Test));
        assert_eq!(cli.profile.as_deref(), Some("work"));
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Cli::try_parse_from(["proxiewy", "--port", "70000", "run"]).is_err());
    }
}
