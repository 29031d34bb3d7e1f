//! Release Health - session statistics query core
//!
//! This library answers aggregate questions about application sessions:
//! - Session and distinct-user counts per release, environment and project
//! - Session duration averages and percentiles
//! - Crash-free rates for sessions and users
//! - Breakdowns by final session status
//! - Dense time series aligned to a fixed bucket grid

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod storage;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Tracing subscriber installation
pub mod logging;

/// Sessions query pipeline: definition, execution, massaging
pub mod query;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result, StoreError};
pub use query::{QueryDefinition, SessionsEngine, SessionsResult};
pub use types::{Scope, TimeRange};
