//! Core data types shared by the query pipeline
//!
//! # Key Types
//!
//! - **`Timestamp`**: Unix timestamp in whole seconds
//! - **`ProjectId`** / **`OrganizationId`**: Numeric identifiers of the query scope
//! - **`TimeRange`**: Half-open time window `[start, end)` for queries
//! - **`Scope`**: Organization plus the projects the caller may read
//!
//! # Example
//!
//! ```rust
//! use release_health::types::{Scope, TimeRange};
//!
//! let range = TimeRange::new(0, 3600).unwrap();
//! assert!(range.contains(0));
//! assert!(!range.contains(3600));
//!
//! let scope = Scope::new(1, vec![42, 7]);
//! assert_eq!(scope.project_ids, vec![7, 42]);
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix timestamp in seconds
pub type Timestamp = i64;

/// Project identifier
pub type ProjectId = u64;

/// Organization identifier
pub type OrganizationId = u64;

/// Seconds in one hour
pub const ONE_HOUR: u64 = 3_600;

/// Seconds in one day
pub const ONE_DAY: u64 = 86_400;

/// Half-open time range `[start, end)` in unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,

    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range, rejecting `start > end`
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, crate::error::Error> {
        if start > end {
            return Err(crate::error::Error::Configuration(format!(
                "Invalid time range: start {} > end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Create a time range without checking the bounds
    pub fn new_unchecked(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check whether `timestamp` falls inside `[start, end)`
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Length of the range in seconds
    pub fn duration_secs(&self) -> i64 {
        self.end - self.start
    }

    /// Check whether the range covers no time at all
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Organization and project scope a query is allowed to read
///
/// Permission resolution happens before the core sees a request; a `Scope`
/// is trusted as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Organization the request belongs to
    pub organization_id: OrganizationId,

    /// Accessible projects, sorted and deduplicated
    pub project_ids: Vec<ProjectId>,
}

impl Scope {
    /// Create a scope, normalizing the project list
    pub fn new(organization_id: OrganizationId, mut project_ids: Vec<ProjectId>) -> Self {
        project_ids.sort_unstable();
        project_ids.dedup();
        Self {
            organization_id,
            project_ids,
        }
    }

    /// Check whether a project is part of this scope
    pub fn contains_project(&self, project_id: ProjectId) -> bool {
        self.project_ids.binary_search(&project_id).is_ok()
    }
}

/// Convert unix seconds to a UTC datetime
///
/// Returns `None` for timestamps chrono cannot represent.
pub fn to_datetime(timestamp: Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0).single()
}
