//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::MonitoringConfig;
use crate::error::{Error, Result};

/// Install the global tracing subscriber
///
/// Fails if the filter directive is invalid or a global subscriber is
/// already installed.
pub fn init(config: &MonitoringConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| Error::Configuration(format!("Invalid log level '{}': {}", config.log_level, e)))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = if config.json_logging {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Configuration(format!("Failed to install subscriber: {}", e)))
}
