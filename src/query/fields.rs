//! Field Semantics Registry
//!
//! The fixed vocabulary of requestable fields. Each [`SessionField`] maps to
//! a static [`FieldSpec`] describing:
//!
//! - the aggregation it represents
//! - the store columns it is computed from
//! - its fill value for cells without data
//! - whether it is ratio-like (undefined, never zero, without a denominator)
//!
//! | field                       | kind           | fill      |
//! |-----------------------------|----------------|-----------|
//! | `sum(session)`              | sum            | 0         |
//! | `count_unique(user)`        | count-distinct | 0         |
//! | `avg(session.duration)`     | average        | undefined |
//! | `pNN(session.duration)`     | quantile       | undefined |
//! | `max(session.duration)`     | max            | undefined |
//! | `crash_free_rate(session)`  | ratio          | undefined |
//! | `crash_free_rate(user)`     | ratio          | undefined |
//!
//! The table is immutable and shared process-wide.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::query::definition::SessionStatus;
use crate::query::error::{QueryError, QueryResult};
use crate::query::executor::RawRow;
use crate::query::result::FieldValue;

// ============================================================================
// Store columns
// ============================================================================

/// Aggregate columns the session store can compute per group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreColumn {
    /// Number of sessions
    Sessions,
    /// Sessions that ended in any unhealthy state (errored, crashed, abnormal)
    SessionsErrored,
    /// Sessions that crashed
    SessionsCrashed,
    /// Sessions that ended abnormally
    SessionsAbnormal,
    /// Distinct users
    Users,
    /// Distinct users with at least one unhealthy session
    UsersErrored,
    /// Distinct users with at least one crashed session
    UsersCrashed,
    /// Distinct users with at least one abnormal session
    UsersAbnormal,
    /// Mean duration of healthy sessions
    DurationAvg,
    /// 50th percentile duration of healthy sessions
    DurationP50,
    /// 75th percentile duration of healthy sessions
    DurationP75,
    /// 90th percentile duration of healthy sessions
    DurationP90,
    /// 95th percentile duration of healthy sessions
    DurationP95,
    /// 99th percentile duration of healthy sessions
    DurationP99,
    /// Longest healthy session
    DurationMax,
}

impl StoreColumn {
    /// Column name in the store
    pub fn name(self) -> &'static str {
        match self {
            StoreColumn::Sessions => "sessions",
            StoreColumn::SessionsErrored => "sessions_errored",
            StoreColumn::SessionsCrashed => "sessions_crashed",
            StoreColumn::SessionsAbnormal => "sessions_abnormal",
            StoreColumn::Users => "users",
            StoreColumn::UsersErrored => "users_errored",
            StoreColumn::UsersCrashed => "users_crashed",
            StoreColumn::UsersAbnormal => "users_abnormal",
            StoreColumn::DurationAvg => "duration_avg",
            StoreColumn::DurationP50 => "duration_p50",
            StoreColumn::DurationP75 => "duration_p75",
            StoreColumn::DurationP90 => "duration_p90",
            StoreColumn::DurationP95 => "duration_p95",
            StoreColumn::DurationP99 => "duration_p99",
            StoreColumn::DurationMax => "duration_max",
        }
    }

    /// Quantile computed by a duration column, if it is one
    pub fn quantile(self) -> Option<f64> {
        match self {
            StoreColumn::DurationP50 => Some(0.50),
            StoreColumn::DurationP75 => Some(0.75),
            StoreColumn::DurationP90 => Some(0.90),
            StoreColumn::DurationP95 => Some(0.95),
            StoreColumn::DurationP99 => Some(0.99),
            StoreColumn::DurationMax => Some(1.0),
            _ => None,
        }
    }
}

impl fmt::Display for StoreColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Fields
// ============================================================================

/// Requestable fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionField {
    /// Total number of sessions
    #[serde(rename = "sum(session)")]
    Sessions,
    /// Number of distinct users
    #[serde(rename = "count_unique(user)")]
    Users,
    /// Average healthy session duration
    #[serde(rename = "avg(session.duration)")]
    DurationAvg,
    /// Median healthy session duration
    #[serde(rename = "p50(session.duration)")]
    DurationP50,
    /// 75th percentile healthy session duration
    #[serde(rename = "p75(session.duration)")]
    DurationP75,
    /// 90th percentile healthy session duration
    #[serde(rename = "p90(session.duration)")]
    DurationP90,
    /// 95th percentile healthy session duration
    #[serde(rename = "p95(session.duration)")]
    DurationP95,
    /// 99th percentile healthy session duration
    #[serde(rename = "p99(session.duration)")]
    DurationP99,
    /// Longest healthy session
    #[serde(rename = "max(session.duration)")]
    DurationMax,
    /// Share of sessions that did not crash
    #[serde(rename = "crash_free_rate(session)")]
    CrashFreeSessions,
    /// Share of users without a crashed session
    #[serde(rename = "crash_free_rate(user)")]
    CrashFreeUsers,
}

impl SessionField {
    /// Every field, in registry order
    pub const ALL: [SessionField; 11] = [
        SessionField::Sessions,
        SessionField::Users,
        SessionField::DurationAvg,
        SessionField::DurationP50,
        SessionField::DurationP75,
        SessionField::DurationP90,
        SessionField::DurationP95,
        SessionField::DurationP99,
        SessionField::DurationMax,
        SessionField::CrashFreeSessions,
        SessionField::CrashFreeUsers,
    ];

    /// Registry entry for this field
    pub fn spec(self) -> &'static FieldSpec {
        let index = match self {
            SessionField::Sessions => 0,
            SessionField::Users => 1,
            SessionField::DurationAvg => 2,
            SessionField::DurationP50 => 3,
            SessionField::DurationP75 => 4,
            SessionField::DurationP90 => 5,
            SessionField::DurationP95 => 6,
            SessionField::DurationP99 => 7,
            SessionField::DurationMax => 8,
            SessionField::CrashFreeSessions => 9,
            SessionField::CrashFreeUsers => 10,
        };
        &FIELD_SPECS[index]
    }

    /// Public field name
    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

impl fmt::Display for SessionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SessionField {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lookup(s).map(|spec| spec.field)
    }
}

/// How a field aggregates its store columns
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Plain sum
    Sum,
    /// Count of distinct values
    CountDistinct,
    /// Arithmetic mean
    Average,
    /// Quantile in `0.0..=1.0`
    Quantile(f64),
    /// Maximum
    Max,
    /// `1 - numerator / denominator`
    Ratio,
}

/// Registry entry
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Field this entry describes
    pub field: SessionField,
    /// Public name
    pub name: &'static str,
    /// Aggregation kind
    pub kind: AggregationKind,
    /// Value for cells without any store row
    pub fill: FieldValue,
    /// Left undefined rather than zero-filled when the denominator is missing
    pub ratio_like: bool,
}

const SESSION_COLUMNS: &[StoreColumn] = &[StoreColumn::Sessions];
const SESSION_STATUS_COLUMNS: &[StoreColumn] = &[
    StoreColumn::Sessions,
    StoreColumn::SessionsErrored,
    StoreColumn::SessionsCrashed,
    StoreColumn::SessionsAbnormal,
];
const USER_COLUMNS: &[StoreColumn] = &[StoreColumn::Users];
const USER_STATUS_COLUMNS: &[StoreColumn] = &[
    StoreColumn::Users,
    StoreColumn::UsersErrored,
    StoreColumn::UsersCrashed,
    StoreColumn::UsersAbnormal,
];
const CRASH_FREE_SESSION_COLUMNS: &[StoreColumn] =
    &[StoreColumn::Sessions, StoreColumn::SessionsCrashed];
const CRASH_FREE_USER_COLUMNS: &[StoreColumn] = &[StoreColumn::Users, StoreColumn::UsersCrashed];

const fn count_field(field: SessionField, name: &'static str, kind: AggregationKind) -> FieldSpec {
    FieldSpec {
        field,
        name,
        kind,
        fill: FieldValue::Count(0),
        ratio_like: false,
    }
}

const fn duration_field(
    field: SessionField,
    name: &'static str,
    kind: AggregationKind,
) -> FieldSpec {
    FieldSpec {
        field,
        name,
        kind,
        fill: FieldValue::Undefined,
        ratio_like: false,
    }
}

const fn ratio_field(field: SessionField, name: &'static str) -> FieldSpec {
    FieldSpec {
        field,
        name,
        kind: AggregationKind::Ratio,
        fill: FieldValue::Undefined,
        ratio_like: true,
    }
}

static FIELD_SPECS: [FieldSpec; 11] = [
    count_field(SessionField::Sessions, "sum(session)", AggregationKind::Sum),
    count_field(
        SessionField::Users,
        "count_unique(user)",
        AggregationKind::CountDistinct,
    ),
    duration_field(
        SessionField::DurationAvg,
        "avg(session.duration)",
        AggregationKind::Average,
    ),
    duration_field(
        SessionField::DurationP50,
        "p50(session.duration)",
        AggregationKind::Quantile(0.50),
    ),
    duration_field(
        SessionField::DurationP75,
        "p75(session.duration)",
        AggregationKind::Quantile(0.75),
    ),
    duration_field(
        SessionField::DurationP90,
        "p90(session.duration)",
        AggregationKind::Quantile(0.90),
    ),
    duration_field(
        SessionField::DurationP95,
        "p95(session.duration)",
        AggregationKind::Quantile(0.95),
    ),
    duration_field(
        SessionField::DurationP99,
        "p99(session.duration)",
        AggregationKind::Quantile(0.99),
    ),
    duration_field(
        SessionField::DurationMax,
        "max(session.duration)",
        AggregationKind::Max,
    ),
    ratio_field(SessionField::CrashFreeSessions, "crash_free_rate(session)"),
    ratio_field(SessionField::CrashFreeUsers, "crash_free_rate(user)"),
];

lazy_static! {
    static ref FIELDS_BY_NAME: HashMap<&'static str, SessionField> = FIELD_SPECS
        .iter()
        .map(|spec| (spec.name, spec.field))
        .collect();
}

/// Look up a field by its public name
pub fn lookup(name: &str) -> QueryResult<&'static FieldSpec> {
    FIELDS_BY_NAME
        .get(name)
        .map(|field| field.spec())
        .ok_or_else(|| QueryError::unknown_field("field", name))
}

impl FieldSpec {
    /// Store columns this field reads
    ///
    /// Splitting by session status needs the per-status breakdown columns.
    pub fn columns(&self, split_by_status: bool) -> &'static [StoreColumn] {
        match self.field {
            SessionField::Sessions if split_by_status => SESSION_STATUS_COLUMNS,
            SessionField::Sessions => SESSION_COLUMNS,
            SessionField::Users if split_by_status => USER_STATUS_COLUMNS,
            SessionField::Users => USER_COLUMNS,
            SessionField::DurationAvg => &[StoreColumn::DurationAvg],
            SessionField::DurationP50 => &[StoreColumn::DurationP50],
            SessionField::DurationP75 => &[StoreColumn::DurationP75],
            SessionField::DurationP90 => &[StoreColumn::DurationP90],
            SessionField::DurationP95 => &[StoreColumn::DurationP95],
            SessionField::DurationP99 => &[StoreColumn::DurationP99],
            SessionField::DurationMax => &[StoreColumn::DurationMax],
            SessionField::CrashFreeSessions => CRASH_FREE_SESSION_COLUMNS,
            SessionField::CrashFreeUsers => CRASH_FREE_USER_COLUMNS,
        }
    }

    /// Compute this field's value for one cell
    ///
    /// `row` is the store row backing the cell, `None` when the store
    /// returned nothing for it. `status` is set when results are split by
    /// session status.
    pub fn extract(&self, row: Option<&RawRow>, status: Option<SessionStatus>) -> FieldValue {
        let Some(row) = row else {
            return self.fill;
        };

        match self.field {
            SessionField::Sessions => FieldValue::Count(split_count(
                row,
                status,
                [
                    StoreColumn::Sessions,
                    StoreColumn::SessionsErrored,
                    StoreColumn::SessionsCrashed,
                    StoreColumn::SessionsAbnormal,
                ],
            )),
            SessionField::Users => FieldValue::Count(split_count(
                row,
                status,
                [
                    StoreColumn::Users,
                    StoreColumn::UsersErrored,
                    StoreColumn::UsersCrashed,
                    StoreColumn::UsersAbnormal,
                ],
            )),
            SessionField::DurationAvg
            | SessionField::DurationP50
            | SessionField::DurationP75
            | SessionField::DurationP90
            | SessionField::DurationP95
            | SessionField::DurationP99
            | SessionField::DurationMax => match status {
                None | Some(SessionStatus::Healthy) => {
                    row.get(self.columns(false)[0]).to_number()
                }
                Some(_) => FieldValue::Undefined,
            },
            SessionField::CrashFreeSessions => {
                crash_free_rate(row, StoreColumn::Sessions, StoreColumn::SessionsCrashed)
            }
            SessionField::CrashFreeUsers => {
                crash_free_rate(row, StoreColumn::Users, StoreColumn::UsersCrashed)
            }
        }
    }
}

/// Count for a status slice; `columns` is `[total, errored, crashed, abnormal]`
fn split_count(row: &RawRow, status: Option<SessionStatus>, columns: [StoreColumn; 4]) -> u64 {
    let [total, errored, crashed, abnormal] = columns.map(|c| row.get(c).as_count());
    match status {
        None => total,
        Some(SessionStatus::Healthy) => total.saturating_sub(errored),
        Some(SessionStatus::Errored) => errored.saturating_sub(crashed).saturating_sub(abnormal),
        Some(SessionStatus::Crashed) => crashed,
        Some(SessionStatus::Abnormal) => abnormal,
    }
}

/// `1 - crashed / total`, clamped to `[0, 1]`; undefined when either
/// column is missing or nothing was recorded
fn crash_free_rate(row: &RawRow, total: StoreColumn, crashed: StoreColumn) -> FieldValue {
    let rate = match (row.get(total).as_f64(), row.get(crashed).as_f64()) {
        (Some(total), Some(crashed)) if total > 0.0 => {
            Some((1.0 - crashed / total).clamp(0.0, 1.0))
        }
        _ => None,
    };
    FieldValue::from(rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::error::QueryErrorKind;

    fn row(values: &[(StoreColumn, FieldValue)]) -> RawRow {
        let mut row = RawRow::new();
        for (column, value) in values {
            row.set(*column, *value);
        }
        row
    }

    #[test]
    fn test_registry_order_matches_enum() {
        for field in SessionField::ALL {
            assert_eq!(field.spec().field, field);
            assert_eq!(lookup(field.name()).unwrap().field, field);
        }
    }

    #[test]
    fn test_lookup_unknown() {
        let err = lookup("sum(users)").unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::UnknownField);
        assert_eq!(err.parameter.as_deref(), Some("field"));
    }

    #[test]
    fn test_fill_values() {
        assert_eq!(SessionField::Sessions.spec().extract(None, None), FieldValue::Count(0));
        assert_eq!(SessionField::Users.spec().extract(None, None), FieldValue::Count(0));
        for field in [
            SessionField::DurationAvg,
            SessionField::DurationP95,
            SessionField::CrashFreeSessions,
        ] {
            assert!(field.spec().extract(None, None).is_undefined());
        }
        assert!(SessionField::CrashFreeUsers.spec().ratio_like);
        assert!(!SessionField::Sessions.spec().ratio_like);
    }

    #[test]
    fn test_status_split() {
        let r = row(&[
            (StoreColumn::Sessions, FieldValue::Count(100)),
            (StoreColumn::SessionsErrored, FieldValue::Count(30)),
            (StoreColumn::SessionsCrashed, FieldValue::Count(10)),
            (StoreColumn::SessionsAbnormal, FieldValue::Count(5)),
        ]);
        let spec = SessionField::Sessions.spec();
        assert_eq!(spec.extract(Some(&r), None), FieldValue::Count(100));
        assert_eq!(
            spec.extract(Some(&r), Some(SessionStatus::Healthy)),
            FieldValue::Count(70)
        );
        assert_eq!(
            spec.extract(Some(&r), Some(SessionStatus::Errored)),
            FieldValue::Count(15)
        );
        assert_eq!(
            spec.extract(Some(&r), Some(SessionStatus::Crashed)),
            FieldValue::Count(10)
        );
        assert_eq!(
            spec.extract(Some(&r), Some(SessionStatus::Abnormal)),
            FieldValue::Count(5)
        );
    }

    #[test]
    fn test_status_split_saturates() {
        let r = row(&[
            (StoreColumn::Users, FieldValue::Count(2)),
            (StoreColumn::UsersErrored, FieldValue::Count(3)),
            (StoreColumn::UsersCrashed, FieldValue::Count(3)),
            (StoreColumn::UsersAbnormal, FieldValue::Count(1)),
        ]);
        let spec = SessionField::Users.spec();
        assert_eq!(
            spec.extract(Some(&r), Some(SessionStatus::Healthy)),
            FieldValue::Count(0)
        );
        assert_eq!(
            spec.extract(Some(&r), Some(SessionStatus::Errored)),
            FieldValue::Count(0)
        );
    }

    #[test]
    fn test_duration_only_for_healthy() {
        let r = row(&[(StoreColumn::DurationP50, FieldValue::Number(42.0))]);
        let spec = SessionField::DurationP50.spec();
        assert_eq!(spec.extract(Some(&r), None), FieldValue::Number(42.0));
        assert_eq!(
            spec.extract(Some(&r), Some(SessionStatus::Healthy)),
            FieldValue::Number(42.0)
        );
        assert!(spec
            .extract(Some(&r), Some(SessionStatus::Crashed))
            .is_undefined());
        // a row without any healthy session carries a null duration
        let empty = row(&[(StoreColumn::DurationP50, FieldValue::Undefined)]);
        assert!(spec.extract(Some(&empty), None).is_undefined());
    }

    #[test]
    fn test_crash_free_rate() {
        let spec = SessionField::CrashFreeSessions.spec();
        let r = row(&[
            (StoreColumn::Sessions, FieldValue::Count(200)),
            (StoreColumn::SessionsCrashed, FieldValue::Count(50)),
        ]);
        assert_eq!(spec.extract(Some(&r), None), FieldValue::Number(0.75));

        let zero = row(&[
            (StoreColumn::Sessions, FieldValue::Count(0)),
            (StoreColumn::SessionsCrashed, FieldValue::Count(0)),
        ]);
        assert!(spec.extract(Some(&zero), None).is_undefined());
    }

    #[test]
    fn test_crash_free_rate_without_crashed_column() {
        let spec = SessionField::CrashFreeUsers.spec();
        let r = row(&[(StoreColumn::Users, FieldValue::Count(40))]);
        assert!(spec.extract(Some(&r), None).is_undefined());
        assert!(spec.extract(None, None).is_undefined());
    }

    #[test]
    fn test_crash_free_rate_is_clamped() {
        let spec = SessionField::CrashFreeSessions.spec();
        let more_crashes = row(&[
            (StoreColumn::Sessions, FieldValue::Count(10)),
            (StoreColumn::SessionsCrashed, FieldValue::Count(25)),
        ]);
        assert_eq!(spec.extract(Some(&more_crashes), None), FieldValue::Number(0.0));

        let no_crashes = row(&[
            (StoreColumn::Sessions, FieldValue::Count(10)),
            (StoreColumn::SessionsCrashed, FieldValue::Count(0)),
        ]);
        assert_eq!(spec.extract(Some(&no_crashes), None), FieldValue::Number(1.0));
    }

    #[test]
    fn test_columns() {
        assert_eq!(SessionField::Sessions.spec().columns(false), &[StoreColumn::Sessions]);
        assert_eq!(SessionField::Users.spec().columns(true).len(), 4);
        assert_eq!(
            SessionField::CrashFreeUsers.spec().columns(false),
            &[StoreColumn::Users, StoreColumn::UsersCrashed]
        );
        assert_eq!(StoreColumn::DurationMax.quantile(), Some(1.0));
        assert_eq!(StoreColumn::Users.quantile(), None);
    }

    #[test]
    fn test_field_serializes_as_name() {
        assert_eq!(
            serde_json::to_string(&SessionField::CrashFreeUsers).unwrap(),
            "\"crash_free_rate(user)\""
        );
    }
}
