//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Without it, the
//! `scant` target logs at the configured level and everything else at `warn`.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::ScanConfig;

/// Install the global subscriber described by `config.application`.
///
/// Logs go to stderr so stdout stays free for machine-readable output.
///
/// # Errors
/// Fails if the level cannot be parsed or a global subscriber is already
/// installed.
pub fn init_from_config(config: &ScanConfig) -> Result<()> {
    let app = &config.application;
    let filter = build_filter(&app.log_level)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match app.log_format.as_str() {
        "json" => builder.json().with_current_span(true).try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("warn,scant={level}"))
        .map_err(|e| anyhow!("invalid log level '{level}': {e}"))
}
