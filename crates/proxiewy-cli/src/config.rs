//! Configuration file loading.
//!
//! The file is a read-only snapshot of what a desktop front end would hand
//! the engine. Every section is optional.

use crate::cli::Cli;
use crate::error::{CliError, Result};
use proxiewy_engine::{EngineSettings, ProxyDescriptor, RuleDescriptor};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub settings: EngineSettings,
    pub proxies: Vec<ProxyDescriptor>,
    pub rules: Vec<RuleDescriptor>,
    pub active_profile: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| CliError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Load the file named on the command line (if any) and apply the
    /// command-line overrides.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(bind) = cli.bind {
            config.settings.bind_addr = bind;
        }
        if let Some(port) = cli.port {
            config.settings.port = port;
        }
        if let Some(profile) = &cli.profile {
            config.active_profile = Some(profile.clone());
        }
        Ok(config)
    }
}
