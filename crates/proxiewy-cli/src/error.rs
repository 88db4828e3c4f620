//! Errors surfaced by the CLI.

use proxiewy_engine::ProxyError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Cannot read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("{failed} of {total} proxies failed their test")]
    ProxyTestsFailed { failed: usize, total: usize },

    #[error(transparent)]
    Engine(#[from] ProxyError),
}

pub type Result<T> = std::result::Result<T, CliError>;
