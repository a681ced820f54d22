//! Logging setup

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::error::{BridgeError, BridgeResult};

/// Log filter for the configuration; `RUST_LOG` wins when set
pub fn log_filter(config: &AppConfig) -> BridgeResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let level = if config.debug { "debug" } else { config.log_level.as_str() };

    EnvFilter::try_new(level).map_err(|err| BridgeError::config(format!("Invalid log level {}: {}", level, err)))
}

/// Install the global tracing subscriber
pub fn init_logging(config: &AppConfig) -> BridgeResult<()> {
    let filter = log_filter(config)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| BridgeError::config(format!("Failed to initialize logging: {}", err)))
}
