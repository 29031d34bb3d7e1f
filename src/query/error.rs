//! Query error types
//!
//! Structured errors for the building, execution and assembly phases of a
//! sessions query. Every error carries a kind for programmatic handling and,
//! for request errors, the name of the offending parameter.

use std::fmt;

/// Query error with context
#[derive(Debug)]
pub struct QueryError {
    /// Error kind for programmatic handling
    pub kind: QueryErrorKind,
    /// Human-readable message
    pub message: String,
    /// Request parameter that caused the error, if any
    pub parameter: Option<String>,
    /// Optional source error
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Create a new query error
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            parameter: None,
            source: None,
        }
    }

    /// Add source error for error chaining
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach the name of the offending request parameter
    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameter = Some(parameter.into());
        self
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Validation, message)
    }

    /// Create a validation error for a named parameter
    pub fn invalid_param(parameter: &str, message: impl Into<String>) -> Self {
        Self::validation(message).with_parameter(parameter)
    }

    /// Create an unknown field/dimension error for a named parameter
    pub fn unknown_field(parameter: &str, name: &str) -> Self {
        let message = match parameter {
            "groupBy" => format!("Invalid groupBy: {}", name),
            _ => format!("Invalid field: {}", name),
        };
        Self::new(QueryErrorKind::UnknownField, message).with_parameter(parameter)
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Execution, message)
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Internal, message)
    }

    /// Whether the caller can fix this error by changing the request
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind,
            QueryErrorKind::Validation | QueryErrorKind::UnknownField
        )
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parameter {
            Some(param) => write!(f, "{} ({}): {}", self.kind, param, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Categories of query errors for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed or out-of-range request parameter
    Validation,
    /// Requested field or group-by dimension outside the fixed vocabulary
    UnknownField,
    /// The session store failed (timeout, unavailable, rejected query)
    Execution,
    /// Internal error (bug, unexpected state)
    Internal,
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::Validation => write!(f, "ValidationError"),
            QueryErrorKind::UnknownField => write!(f, "UnknownFieldError"),
            QueryErrorKind::Execution => write!(f, "QueryExecutionError"),
            QueryErrorKind::Internal => write!(f, "InternalError"),
        }
    }
}

/// Result type alias for query operations
pub type QueryResult<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_error_creation() {
        let err = QueryError::invalid_param("interval", "interval must divide the range");
        assert_eq!(err.kind, QueryErrorKind::Validation);
        assert_eq!(err.parameter.as_deref(), Some("interval"));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_error_display() {
        let err = QueryError::unknown_field("field", "sum(bogus)");
        let display = format!("{}", err);
        assert!(display.contains("UnknownFieldError"));
        assert!(display.contains("sum(bogus)"));
        assert!(display.contains("(field)"));
    }

    #[test]
    fn test_unknown_group_by_message() {
        let err = QueryError::unknown_field("groupBy", "os");
        assert_eq!(err.message, "Invalid groupBy: os");
    }

    #[test]
    fn test_error_with_source() {
        use std::error::Error;
        let err = QueryError::execution("totals query failed").with_source(StoreError::Timeout);
        assert!(err.source().is_some());
        assert!(!err.is_client_error());
    }
}
