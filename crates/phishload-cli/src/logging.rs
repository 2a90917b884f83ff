//! Subscriber setup for the binary. Logs go to stderr; stdout carries only
//! the run summary.
//!
//! Environment:
//! - `RUST_LOG`: full filter directives, wins over everything else
//! - `LOG_LEVEL`: plain level when `RUST_LOG` is unset (default `info`)
//! - `LOG_FORMAT`: `text` (default) or `json`

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow!("invalid log format: {s}")),
        }
    }
}

fn build_filter(verbose: bool) -> Result<EnvFilter> {
    if verbose {
        return Ok(EnvFilter::new("debug"));
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    EnvFilter::try_new(&level).with_context(|| format!("parsing LOG_LEVEL={level}"))
}

pub fn init(verbose: bool) -> Result<()> {
    let filter = build_filter(verbose)?;
    let format = match std::env::var("LOG_FORMAT") {
        Ok(value) => value.parse()?,
        Err(_) => LogFormat::default(),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|err| anyhow!("installing tracing subscriber: {err}"))
}
