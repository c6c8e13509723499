//! Log subscriber setup for both binaries
//!
//! Records go to stderr so they never mix with relayed child stdout.
//! The level comes from `--log-level`, else `RUST_LOG`, else `info`.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LEVEL: &str = "info";

/// Build the filter from an explicit directive or the environment
pub fn filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(directive) => EnvFilter::try_new(directive).with_context(|| format!("invalid log level {:?}", directive)),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))),
    }
}

/// Install the global subscriber
pub fn init(level: Option<&str>) -> Result<()> {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    #[cfg(debug_assertions)]
    let layer = layer.with_file(true).with_line_number(true);

    tracing_subscriber::registry()
        .with(filter(level)?)
        .with(layer)
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}
