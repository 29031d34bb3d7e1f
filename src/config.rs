//! Configuration management
//!
//! TOML configuration with environment variable overrides and defaults for
//! every field, so an empty file is a valid configuration.
//!
//! ```toml
//! [limits]
//! max_lookback_secs = 7776000
//! max_points = 1000
//!
//! [executor]
//! timeout_ms = 30000
//! parallel = true
//!
//! [monitoring]
//! log_level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::query::executor::ExecutorConfig;
use crate::query::QueryLimits;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Request validation limits
    #[serde(default)]
    pub limits: QueryLimits,

    /// Store query execution
    #[serde(default)]
    pub executor: ExecutorSettings,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutorSettings {
    /// Store deadline in milliseconds (0 = no deadline)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Run totals and series queries concurrently
    #[serde(default = "default_true")]
    pub parallel: bool,
}

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level (error, warn, info, debug, trace) or a full filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logging: bool,

    /// Record Prometheus query metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_timeout_ms() -> u64 { 30_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            parallel: true,
        }
    }
}

impl ExecutorSettings {
    /// Executor configuration for these settings
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            parallel: self.parallel,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
            metrics_enabled: true,
        }
    }
}

impl Config {
    /// Load and validate configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let config = Self::read_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    ///
    /// Validation runs after the overrides are applied.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self, String> {
        let mut config = Self::read_file(path.as_ref())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        // Limits
        if let Some(v) = env_parse("RELEASE_HEALTH_MAX_LOOKBACK_SECS") {
            self.limits.max_lookback_secs = v;
        }
        if let Some(v) = env_parse("RELEASE_HEALTH_MAX_POINTS") {
            self.limits.max_points = v;
        }
        if let Ok(v) = std::env::var("RELEASE_HEALTH_DEFAULT_INTERVAL") {
            self.limits.default_interval = v;
        }

        // Executor
        if let Some(v) = env_parse("RELEASE_HEALTH_TIMEOUT_MS") {
            self.executor.timeout_ms = v;
        }
        if let Some(v) = env_parse("RELEASE_HEALTH_PARALLEL") {
            self.executor.parallel = v;
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
        if let Some(v) = env_parse("RELEASE_HEALTH_JSON_LOGGING") {
            self.monitoring.json_logging = v;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.limits.validate()?;

        if self.monitoring.log_level.trim().is_empty() {
            return Err("Log level cannot be empty".to_string());
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), String> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path.display(), e))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
