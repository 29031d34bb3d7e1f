//! Sessions query pipeline
//!
//! Answers "how many sessions/users, how long, how crash-free" over a time
//! window, split by release, environment, project or final session status:
//!
//! - validated query definitions built from raw request parameters
//! - a bucket grid derived from range and rollup
//! - concurrent totals and series store queries
//! - a massager that merges both row sets into dense, ordered groups
//! - a static registry describing every requestable field
//!
//! # Architecture
//!
//! ```text
//! RawQueryParams
//!      │
//!      ▼
//! ┌─────────────────┐
//! │   Definition    │  validate params, resolve range/rollup/filters
//! └─────────────────┘
//!      │
//!      ├──────────────────────┐
//!      ▼                      ▼
//! ┌─────────────────┐  ┌─────────────────┐
//! │    Executor     │  │   Bucket grid   │
//! │ totals ∥ series │  │                 │
//! └─────────────────┘  └─────────────────┘
//!      │                      │
//!      └──────────┬───────────┘
//!                 ▼
//! ┌─────────────────┐
//! │    Massager     │  union keys, sort, fill, never sparse
//! └─────────────────┘
//!      │
//!      ▼
//! SessionsResult
//! ```
//!
//! # Example
//!
//! ```rust
//! use release_health::query::{RawQueryParams, SessionsEngine};
//! use release_health::storage::{InMemorySessionStore, SessionRecord};
//! use release_health::types::Scope;
//! use chrono::{TimeZone, Utc};
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemorySessionStore::new());
//! store.insert(1, SessionRecord::new(7, "app@1.0", 1_614_560_400));
//!
//! let engine = SessionsEngine::new(store);
//! let params = RawQueryParams::default()
//!     .with_field("sum(session)")
//!     .with_group_by("release")
//!     .with_range("2021-03-01T00:00:00Z", "2021-03-01T04:00:00Z");
//! let now = Utc.with_ymd_and_hms(2021, 3, 2, 0, 0, 0).unwrap();
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let result = runtime
//!     .block_on(engine.query_at(Scope::new(1, vec![7]), &params, now))
//!     .unwrap();
//! assert_eq!(result.groups.len(), 1);
//! assert_eq!(result.intervals.len(), 4);
//! ```

pub mod definition;
pub mod error;
pub mod executor;
pub mod fields;
pub mod grid;
pub mod integration;
pub mod massage;
pub mod params;
pub mod result;

// Re-export main types
pub use definition::{
    Filter, FilterOp, GroupByDimension, QueryDefinition, QueryLimits, SessionStatus,
};
pub use error::{QueryError, QueryErrorKind, QueryResult};
pub use executor::{
    ExecutorConfig, QueryExecutor, QueryKind, RawResults, RawRow, SessionStore, StoreQuery,
};
pub use fields::{lookup, AggregationKind, FieldSpec, SessionField, StoreColumn};
pub use grid::BucketGrid;
pub use integration::SessionsEngine;
pub use massage::{massage, massage_sessions_result};
pub use params::RawQueryParams;
pub use result::{FieldValue, GroupKey, GroupValue, ResultGroup, SessionsResult};
