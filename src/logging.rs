//! tracing subscriber setup

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Resolve the default level: `--verbose` wins over `--quiet`, which wins over
/// the configured level.
pub fn default_level(configured: &str, quiet: bool, verbose: bool) -> Result<LevelFilter> {
    if verbose {
        return Ok(LevelFilter::DEBUG);
    }
    if quiet {
        return Ok(LevelFilter::WARN);
    }
    configured.parse::<LevelFilter>().map_err(|_| Error::Configuration {
        reason: format!("unknown log level: {}", configured),
    })
}

/// Install the global subscriber. `RUST_LOG` still overrides the default
/// level. With `log_file` set, output is appended there without ANSI colors.
pub fn init_logging(level: LevelFilter, format: LogFormat, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let result = match (format, log_file) {
        (LogFormat::Text, None) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        (LogFormat::Json, None) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        (LogFormat::Text, Some(path)) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init()
        }
        (LogFormat::Json, Some(path)) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .json()
                .try_init()
        }
    };

    result.map_err(|e| Error::Configuration {
        reason: format!("failed to install log subscriber: {}", e),
    })
}
