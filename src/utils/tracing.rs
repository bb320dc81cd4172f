//! Logging initialisation
//!
//! `RUST_LOG` takes precedence over the configured level when set.

use crate::config::{LogFormat, LoggingConfig};
use crate::utils::errors::{ResilienceError, ResilienceResult};
use tracing_subscriber::EnvFilter;

/// Build the filter for `config`
pub fn build_filter(config: &LoggingConfig) -> ResilienceResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| ResilienceError::Config(format!("invalid log level '{}': {}", config.level, e)))
}

/// Install the global subscriber. A second call returns an error and leaves
/// the first subscriber in place.
pub fn init_tracing(config: &LoggingConfig) -> ResilienceResult<()> {
    let filter = build_filter(config)?;

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };

    result.map_err(|e| ResilienceError::Config(format!("failed to set tracing subscriber: {}", e)))?;
    tracing::debug!("Tracing initialised (level={}, format={:?})", config.level, config.format);
    Ok(())
}
