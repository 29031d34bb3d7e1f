//! Error types for the crate

use thiserror::Error;

use crate::query::error::QueryError;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Query building or execution error
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors reported by a session store
///
/// These are the store's own failure modes; the executor passes them through
/// unchanged as the source of an execution error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The query did not finish before its deadline
    #[error("Store query timed out")]
    Timeout,

    /// The store could not be reached or refused the query
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the generated query
    #[error("Invalid store query: {0}")]
    InvalidQuery(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
