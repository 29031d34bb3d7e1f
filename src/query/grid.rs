//! Bucket Grid Generator
//!
//! Derives the ordered, gap-free sequence of bucket starts implied by a
//! query's range and rollup. Buckets are half-open `[start, start + rollup)`
//! and aligned to the range start.
//!
//! ```text
//!   start                                              end
//!     │── bucket 0 ──│── bucket 1 ──│── ... ──│── bucket n-1 ──│
//!     t0             t0+rollup      ...       end-rollup
//! ```
//!
//! The grid is recomputed per request and never cached.

use chrono::{DateTime, Utc};

use crate::query::definition::QueryDefinition;
use crate::types::{to_datetime, Timestamp};

/// Ordered bucket starts of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketGrid {
    start: Timestamp,
    rollup: i64,
    buckets: Vec<Timestamp>,
}

impl BucketGrid {
    /// Generate the grid for `[start, end)` with the given rollup
    ///
    /// Callers guarantee `start <= end`, `(end - start) % rollup == 0` and
    /// that both ends are representable as datetimes, which
    /// [`QueryDefinition`] enforces on construction.
    pub fn generate(start: Timestamp, end: Timestamp, rollup: u64) -> Self {
        assert!(rollup > 0, "rollup must be positive");
        assert!(start <= end, "grid start {} after end {}", start, end);
        assert!(
            to_datetime(start).is_some() && to_datetime(end).is_some(),
            "grid [{}, {}) is outside the representable range",
            start,
            end
        );
        let rollup = rollup as i64;
        assert_eq!(
            (end - start) % rollup,
            0,
            "rollup {} does not divide [{}, {})",
            rollup,
            start,
            end
        );

        let buckets = BucketIter {
            current: start,
            end,
            step: rollup,
        }
        .collect();

        Self {
            start,
            rollup,
            buckets,
        }
    }

    /// Generate the grid of a query definition
    pub fn for_query(query: &QueryDefinition) -> Self {
        Self::generate(query.start(), query.end(), query.rollup())
    }

    /// Number of buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the grid has no buckets
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Bucket width in seconds
    pub fn rollup(&self) -> u64 {
        self.rollup as u64
    }

    /// Bucket start timestamps
    pub fn buckets(&self) -> &[Timestamp] {
        &self.buckets
    }

    /// Iterate bucket start timestamps
    pub fn iter(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.buckets.iter().copied()
    }

    /// Index of the bucket starting exactly at `timestamp`
    ///
    /// Returns `None` for timestamps outside the grid or not on a bucket
    /// boundary.
    pub fn index_of(&self, timestamp: Timestamp) -> Option<usize> {
        let offset = timestamp - self.start;
        if offset < 0 || offset % self.rollup != 0 {
            return None;
        }
        let index = (offset / self.rollup) as usize;
        (index < self.buckets.len()).then_some(index)
    }

    /// Bucket starts as UTC datetimes, for labelling series points
    pub fn intervals(&self) -> Vec<DateTime<Utc>> {
        self.buckets.iter().filter_map(|ts| to_datetime(*ts)).collect()
    }
}

/// Iterator over bucket starts
struct BucketIter {
    /// Next bucket start
    current: Timestamp,

    /// Range end (exclusive)
    end: Timestamp,

    /// Bucket width in seconds
    step: i64,
}

impl Iterator for BucketIter {
    type Item = Timestamp;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            return None;
        }
        let bucket = self.current;
        self.current += self.step;
        Some(bucket)
    }
}
