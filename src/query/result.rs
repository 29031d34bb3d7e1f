//! Query result types
//!
//! The massager produces a [`SessionsResult`]: the bucket labels plus one
//! [`ResultGroup`] per distinct group key. Each cell is a [`FieldValue`], which
//! keeps "zero" and "undefined" apart all the way through serialization.

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::query::definition::GroupByDimension;
use crate::query::fields::SessionField;
use crate::types::ProjectId;

// ============================================================================
// Cell values
// ============================================================================

/// Value of one field in one cell (a totals entry or a series point)
///
/// `Undefined` is a distinct state, not a stand-in for zero: it serializes as
/// JSON `null` and is what ratio and duration fields hold when their inputs
/// are missing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Integral count (sessions, users)
    Count(u64),
    /// Floating point measurement (durations, rates)
    Number(f64),
    /// No defined value for this cell
    Undefined,
}

impl FieldValue {
    /// Whether this cell has no defined value
    pub fn is_undefined(&self) -> bool {
        matches!(self, FieldValue::Undefined)
    }

    /// Numeric view of the value, `None` when undefined
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Count(n) => Some(n as f64),
            FieldValue::Number(v) => Some(v),
            FieldValue::Undefined => None,
        }
    }

    /// Integral view of the value; non-integral numbers are rounded and
    /// undefined cells count as zero
    pub fn as_count(&self) -> u64 {
        match *self {
            FieldValue::Count(n) => n,
            FieldValue::Number(v) if v.is_finite() && v > 0.0 => v.round() as u64,
            FieldValue::Number(_) | FieldValue::Undefined => 0,
        }
    }

    /// Convert to a float-valued cell, preserving undefined
    pub fn to_number(self) -> FieldValue {
        match self {
            FieldValue::Count(n) => FieldValue::Number(n as f64),
            other => other,
        }
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => FieldValue::Number(v),
            _ => FieldValue::Undefined,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Count(n) => write!(f, "{}", n),
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Undefined => write!(f, "null"),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            FieldValue::Count(n) => serializer.serialize_u64(n),
            FieldValue::Number(v) if v.is_finite() => serializer.serialize_f64(v),
            FieldValue::Number(_) | FieldValue::Undefined => serializer.serialize_none(),
        }
    }
}

// ============================================================================
// Group keys
// ============================================================================

/// Value of one group-by dimension
///
/// Project ids order numerically, text values by byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupValue {
    /// Numeric project id
    Project(ProjectId),
    /// Release, environment or session status
    Text(String),
}

impl GroupValue {
    /// Create a text value
    pub fn text(value: impl Into<String>) -> Self {
        GroupValue::Text(value.into())
    }
}

impl fmt::Display for GroupValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupValue::Project(id) => write!(f, "{}", id),
            GroupValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Serialize for GroupValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GroupValue::Project(id) => serializer.serialize_u64(*id),
            GroupValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// Ordered tuple of `(dimension, value)` pairs identifying one output group
///
/// Pairs are kept in the query's group-by declaration order, so the derived
/// ordering is lexicographic over values in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(Vec<(GroupByDimension, GroupValue)>);

impl GroupKey {
    /// Create an empty key (the single group of an ungrouped query)
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a key from pairs already in declaration order
    pub fn from_pairs(pairs: Vec<(GroupByDimension, GroupValue)>) -> Self {
        Self(pairs)
    }

    /// Append a pair
    pub fn push(&mut self, dimension: GroupByDimension, value: GroupValue) {
        self.0.push((dimension, value));
    }

    /// Value for a dimension, if present
    pub fn get(&self, dimension: GroupByDimension) -> Option<&GroupValue> {
        self.0
            .iter()
            .find(|(dim, _)| *dim == dimension)
            .map(|(_, value)| value)
    }

    /// Iterate the pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &(GroupByDimension, GroupValue)> {
        self.0.iter()
    }

    /// Number of dimensions in the key
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no dimensions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (dim, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", dim, value)?;
        }
        write!(f, "}}")
    }
}

impl Serialize for GroupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (dim, value) in &self.0 {
            map.serialize_entry(dim.name(), value)?;
        }
        map.end()
    }
}

// ============================================================================
// Result groups
// ============================================================================

/// Totals and time series for one group key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultGroup {
    /// Group-by values identifying this group
    pub by: GroupKey,

    /// Scalar totals per requested field
    pub totals: BTreeMap<SessionField, FieldValue>,

    /// Per-bucket values per requested field, aligned with the bucket grid
    pub series: BTreeMap<SessionField, Vec<FieldValue>>,
}

impl ResultGroup {
    /// Totals value of a field
    pub fn total(&self, field: SessionField) -> Option<FieldValue> {
        self.totals.get(&field).copied()
    }

    /// Series of a field
    pub fn series_of(&self, field: SessionField) -> Option<&[FieldValue]> {
        self.series.get(&field).map(Vec::as_slice)
    }
}

/// Complete response of a sessions query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionsResult {
    /// Start of the queried range (inclusive)
    pub start: DateTime<Utc>,

    /// End of the queried range (exclusive)
    pub end: DateTime<Utc>,

    /// Search query string the request was filtered with
    pub query: String,

    /// Bucket start labels, one per series point
    pub intervals: Vec<DateTime<Utc>>,

    /// Groups in deterministic key order
    pub groups: Vec<ResultGroup>,
}

impl SessionsResult {
    /// Check if the result has no groups
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Find the group with the given key
    pub fn group(&self, by: &GroupKey) -> Option<&ResultGroup> {
        self.groups.iter().find(|g| &g.by == by)
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, crate::error::Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Convert to pretty-printed JSON string
    pub fn to_json_pretty(&self) -> Result<String, crate::error::Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
