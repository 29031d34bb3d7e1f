//! Query definition
//!
//! A [`QueryDefinition`] is the validated, immutable form of a sessions
//! request: resolved time range, rollup, group-by dimensions, requested
//! fields and filters. It can only be built through
//! [`QueryDefinition::from_params`] or [`QueryDefinition::try_new`], both of
//! which enforce:
//!
//! - `start < end`, both representable as UTC datetimes
//! - `(end - start) % rollup == 0`
//! - at least one requested field
//!
//! # Example
//!
//! ```rust
//! use release_health::query::{QueryDefinition, QueryLimits, RawQueryParams};
//! use release_health::types::Scope;
//! use chrono::{TimeZone, Utc};
//!
//! let params = RawQueryParams::default()
//!     .with_field("sum(session)")
//!     .with_group_by("release")
//!     .with_range("2021-03-01T00:00:00Z", "2021-03-01T04:00:00Z")
//!     .with_interval("1h");
//! let now = Utc.with_ymd_and_hms(2021, 3, 2, 0, 0, 0).unwrap();
//!
//! let query = QueryDefinition::from_params(&params, Scope::new(1, vec![1]), &QueryLimits::default(), now)
//!     .unwrap();
//! assert_eq!(query.rollup(), 3600);
//! assert_eq!(query.bucket_count(), 4);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::query::error::{QueryError, QueryResult};
use crate::query::fields::{SessionField, StoreColumn};
use crate::query::params::{self, RawQueryParams};
use crate::query::result::GroupValue;
use crate::types::{to_datetime, Scope, TimeRange, Timestamp, ONE_DAY, ONE_HOUR};

// ============================================================================
// Dimensions
// ============================================================================

/// Dimensions a query can be grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupByDimension {
    /// Project the session belongs to
    #[serde(rename = "project")]
    Project,
    /// Release the session was recorded for
    #[serde(rename = "release")]
    Release,
    /// Deployment environment
    #[serde(rename = "environment")]
    Environment,
    /// Final session status; derived from store columns, never sent to the store
    #[serde(rename = "session.status")]
    SessionStatus,
}

impl GroupByDimension {
    /// All dimensions in declaration order
    pub const ALL: [GroupByDimension; 4] = [
        GroupByDimension::Project,
        GroupByDimension::Release,
        GroupByDimension::Environment,
        GroupByDimension::SessionStatus,
    ];

    /// Public name of the dimension
    pub fn name(self) -> &'static str {
        match self {
            GroupByDimension::Project => "project",
            GroupByDimension::Release => "release",
            GroupByDimension::Environment => "environment",
            GroupByDimension::SessionStatus => "session.status",
        }
    }

    /// Whether the store can group by this dimension directly
    pub fn is_store_column(self) -> bool {
        !matches!(self, GroupByDimension::SessionStatus)
    }
}

impl fmt::Display for GroupByDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GroupByDimension {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GroupByDimension::ALL
            .into_iter()
            .find(|dim| dim.name() == s)
            .ok_or_else(|| QueryError::unknown_field("groupBy", s))
    }
}

/// Final status of a session, as exposed by the `session.status` dimension
///
/// Variants are declared in the order groups are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session ended without a clean shutdown (e.g. the app was killed)
    Abnormal,
    /// Session ended in a crash
    Crashed,
    /// Session saw handled errors but ended cleanly
    Errored,
    /// Session ended cleanly without errors
    Healthy,
}

impl SessionStatus {
    /// All statuses in emission order
    pub const ALL: [SessionStatus; 4] = [
        SessionStatus::Abnormal,
        SessionStatus::Crashed,
        SessionStatus::Errored,
        SessionStatus::Healthy,
    ];

    /// Status name as used in group keys
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Abnormal => "abnormal",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Errored => "errored",
            SessionStatus::Healthy => "healthy",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Filter operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Value must be one of the listed values
    In,
    /// Value must be none of the listed values
    NotIn,
}

/// Predicate on a store dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Filtered dimension (never `session.status`)
    pub dimension: GroupByDimension,
    /// Operator
    pub op: FilterOp,
    /// Values the operator compares against
    pub values: Vec<GroupValue>,
}

impl Filter {
    /// `dimension IN (values)`
    pub fn include(dimension: GroupByDimension, values: Vec<GroupValue>) -> Self {
        Self {
            dimension,
            op: FilterOp::In,
            values,
        }
    }

    /// `dimension NOT IN (values)`
    pub fn exclude(dimension: GroupByDimension, values: Vec<GroupValue>) -> Self {
        Self {
            dimension,
            op: FilterOp::NotIn,
            values,
        }
    }

    /// Evaluate the filter against a dimension value
    pub fn matches(&self, value: &GroupValue) -> bool {
        let found = self.values.iter().any(|v| v == value);
        match self.op {
            FilterOp::In => found,
            FilterOp::NotIn => !found,
        }
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Bounds applied while validating a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLimits {
    /// How far back from now a query may start, in seconds
    #[serde(default = "default_max_lookback_secs")]
    pub max_lookback_secs: u64,

    /// Smallest rollup; every rollup must be a multiple of it
    #[serde(default = "default_min_rollup_secs")]
    pub min_rollup_secs: u64,

    /// Largest rollup
    #[serde(default = "default_max_rollup_secs")]
    pub max_rollup_secs: u64,

    /// Maximum number of buckets in the grid
    #[serde(default = "default_max_points")]
    pub max_points: u64,

    /// Interval used when the request names none
    #[serde(default = "default_interval")]
    pub default_interval: String,

    /// Relative period used when the request names no range at all
    #[serde(default = "default_stats_period")]
    pub default_stats_period: String,
}

fn default_max_lookback_secs() -> u64 { 90 * ONE_DAY }
fn default_min_rollup_secs() -> u64 { ONE_HOUR }
fn default_max_rollup_secs() -> u64 { ONE_DAY }
fn default_max_points() -> u64 { 1_000 }
fn default_interval() -> String { "1h".to_string() }
fn default_stats_period() -> String { "24h".to_string() }

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_lookback_secs: default_max_lookback_secs(),
            min_rollup_secs: default_min_rollup_secs(),
            max_rollup_secs: default_max_rollup_secs(),
            max_points: default_max_points(),
            default_interval: default_interval(),
            default_stats_period: default_stats_period(),
        }
    }
}

impl QueryLimits {
    /// Check internal consistency of the limits
    pub fn validate(&self) -> Result<(), String> {
        if self.min_rollup_secs == 0 {
            return Err("min_rollup_secs must be > 0".to_string());
        }
        if i64::try_from(self.max_lookback_secs).is_err() {
            return Err("max_lookback_secs must fit in a signed 64-bit timestamp".to_string());
        }
        if self.max_rollup_secs > ONE_DAY * 366 {
            return Err("max_rollup_secs must be at most one year".to_string());
        }
        if self.max_rollup_secs < self.min_rollup_secs {
            return Err("max_rollup_secs must be >= min_rollup_secs".to_string());
        }
        if self.max_points == 0 {
            return Err("max_points must be > 0".to_string());
        }
        if params::parse_duration(&self.default_interval).is_none() {
            return Err(format!("invalid default_interval '{}'", self.default_interval));
        }
        if params::parse_duration(&self.default_stats_period).is_none() {
            return Err(format!(
                "invalid default_stats_period '{}'",
                self.default_stats_period
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Query definition
// ============================================================================

/// Validated, immutable sessions query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefinition {
    scope: Scope,
    range: TimeRange,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    rollup: u64,
    group_by: Vec<GroupByDimension>,
    fields: Vec<SessionField>,
    filters: Vec<Filter>,
    query: String,
}

impl QueryDefinition {
    /// Create a definition from already-resolved parts
    ///
    /// Group-by dimensions and fields are deduplicated keeping the first
    /// occurrence.
    pub fn try_new(
        scope: Scope,
        range: TimeRange,
        rollup: u64,
        group_by: Vec<GroupByDimension>,
        fields: Vec<SessionField>,
        filters: Vec<Filter>,
    ) -> QueryResult<Self> {
        if fields.is_empty() {
            return Err(QueryError::invalid_param(
                "field",
                "Request is missing a \"field\"",
            ));
        }
        if rollup == 0 {
            return Err(QueryError::invalid_param("interval", "interval must be > 0"));
        }
        let start_at = representable(range.start, "start")?;
        let end_at = representable(range.end, "end")?;
        if range.is_empty() {
            return Err(QueryError::invalid_param(
                "start",
                format!("start must be before end, got {}", range),
            ));
        }
        if range.duration_secs() % rollup as i64 != 0 {
            return Err(QueryError::invalid_param(
                "interval",
                format!(
                    "interval of {}s does not evenly divide the {}s time range",
                    rollup,
                    range.duration_secs()
                ),
            ));
        }

        let group_by = dedup(group_by);
        let fields = dedup(fields);
        if group_by.contains(&GroupByDimension::SessionStatus) {
            if let Some(field) = fields.iter().find(|f| f.spec().ratio_like) {
                return Err(QueryError::invalid_param(
                    "groupBy",
                    format!("Cannot group field {} by session.status", field.name()),
                ));
            }
        }
        if let Some(filter) = filters.iter().find(|f| !f.dimension.is_store_column()) {
            return Err(QueryError::invalid_param(
                "query",
                format!("Cannot filter by {}", filter.dimension),
            ));
        }

        Ok(Self {
            scope,
            range,
            start_at,
            end_at,
            rollup,
            group_by,
            fields,
            filters,
            query: String::new(),
        })
    }

    /// Validate raw request parameters into a definition
    ///
    /// Fails on the first invalid parameter. `now` anchors relative periods
    /// and the lookback limit.
    pub fn from_params(
        params: &RawQueryParams,
        scope: Scope,
        limits: &QueryLimits,
        now: DateTime<Utc>,
    ) -> QueryResult<Self> {
        limits
            .validate()
            .map_err(|e| QueryError::internal(format!("Invalid query limits: {}", e)))?;
        if params.field.is_empty() {
            return Err(QueryError::invalid_param(
                "field",
                "Request is missing a \"field\"",
            ));
        }
        let fields = params
            .field
            .iter()
            .map(|name| name.parse::<SessionField>())
            .collect::<QueryResult<Vec<_>>>()?;
        let group_by = params
            .group_by
            .iter()
            .map(|name| name.parse::<GroupByDimension>())
            .collect::<QueryResult<Vec<_>>>()?;

        let rollup = resolve_rollup(params, limits)?;
        let range = resolve_range(params, rollup, limits, now)?;
        let scope = resolve_scope(params, scope)?;

        let mut filters = Vec::new();
        if !params.environment.is_empty() {
            filters.push(Filter::include(
                GroupByDimension::Environment,
                params.environment.iter().map(GroupValue::text).collect(),
            ));
        }
        let query = params.query.clone().unwrap_or_default();
        filters.extend(params::parse_search_query(&query)?);

        let mut definition = Self::try_new(scope, range, rollup, group_by, fields, filters)?;
        definition.query = query;
        Ok(definition)
    }

    /// Scope the query reads
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Resolved half-open time range
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Range start (inclusive)
    pub fn start(&self) -> Timestamp {
        self.range.start
    }

    /// Range end (exclusive)
    pub fn end(&self) -> Timestamp {
        self.range.end
    }

    /// Range start as a UTC datetime
    pub fn start_datetime(&self) -> DateTime<Utc> {
        self.start_at
    }

    /// Range end as a UTC datetime
    pub fn end_datetime(&self) -> DateTime<Utc> {
        self.end_at
    }

    /// Bucket width in seconds
    pub fn rollup(&self) -> u64 {
        self.rollup
    }

    /// Number of buckets in the grid
    pub fn bucket_count(&self) -> usize {
        (self.range.duration_secs() as u64 / self.rollup) as usize
    }

    /// Group-by dimensions in declaration order
    pub fn group_by(&self) -> &[GroupByDimension] {
        &self.group_by
    }

    /// Requested fields in request order
    pub fn fields(&self) -> &[SessionField] {
        &self.fields
    }

    /// Filter predicates
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Raw search query string
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Whether results are split by session status
    pub fn is_split_by_status(&self) -> bool {
        self.group_by.contains(&GroupByDimension::SessionStatus)
    }

    /// Group-by dimensions the store groups by
    pub fn store_group_by(&self) -> Vec<GroupByDimension> {
        self.group_by
            .iter()
            .copied()
            .filter(|dim| dim.is_store_column())
            .collect()
    }

    /// Store columns needed to compute every requested field
    pub fn store_columns(&self) -> Vec<StoreColumn> {
        let split = self.is_split_by_status();
        let mut columns: Vec<StoreColumn> = self
            .fields
            .iter()
            .flat_map(|field| field.spec().columns(split).iter().copied())
            .collect();
        columns.sort_unstable();
        columns.dedup();
        columns
    }
}

fn dedup<T: PartialEq + Copy>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn representable(timestamp: Timestamp, param: &str) -> QueryResult<DateTime<Utc>> {
    to_datetime(timestamp).ok_or_else(|| {
        QueryError::invalid_param(param, format!("Timestamp {} is out of range", timestamp))
    })
}

fn resolve_rollup(params: &RawQueryParams, limits: &QueryLimits) -> QueryResult<u64> {
    let raw = params
        .interval
        .as_deref()
        .unwrap_or(&limits.default_interval);
    let rollup = params::parse_duration(raw).ok_or_else(|| {
        QueryError::invalid_param("interval", format!("Invalid interval: {}", raw))
    })?;

    if rollup < limits.min_rollup_secs || rollup % limits.min_rollup_secs != 0 {
        return Err(QueryError::invalid_param(
            "interval",
            format!(
                "The interval has to be a multiple of the minimum interval of {}s",
                limits.min_rollup_secs
            ),
        ));
    }
    if rollup > limits.max_rollup_secs {
        return Err(QueryError::invalid_param(
            "interval",
            format!(
                "The interval has to be at most {}s",
                limits.max_rollup_secs
            ),
        ));
    }
    if rollup <= ONE_DAY && ONE_DAY % rollup != 0 {
        return Err(QueryError::invalid_param(
            "interval",
            "The interval should divide one day without a remainder",
        ));
    }
    Ok(rollup)
}

fn resolve_range(
    params: &RawQueryParams,
    rollup: u64,
    limits: &QueryLimits,
    now: DateTime<Utc>,
) -> QueryResult<TimeRange> {
    let now = now.timestamp();
    let (range, param) = match (&params.start, &params.end) {
        (Some(start), Some(end)) => {
            if params.stats_period.is_some() {
                return Err(QueryError::invalid_param(
                    "statsPeriod",
                    "statsPeriod cannot be combined with start and end",
                ));
            }
            let start = params::parse_timestamp(start).ok_or_else(|| {
                QueryError::invalid_param("start", format!("Invalid start: {}", start))
            })?;
            let end = params::parse_timestamp(end).ok_or_else(|| {
                QueryError::invalid_param("end", format!("Invalid end: {}", end))
            })?;
            representable(start, "start")?;
            representable(end, "end")?;
            (TimeRange::new_unchecked(start, end), "start")
        }
        (Some(_), None) => {
            return Err(QueryError::invalid_param("end", "start requires an end"));
        }
        (None, Some(_)) => {
            return Err(QueryError::invalid_param("start", "end requires a start"));
        }
        (None, None) => {
            let raw = params
                .stats_period
                .as_deref()
                .unwrap_or(&limits.default_stats_period);
            let period = params::parse_duration(raw)
                .filter(|p| *p > 0)
                .ok_or_else(|| {
                    QueryError::invalid_param("statsPeriod", format!("Invalid statsPeriod: {}", raw))
                })?;
            if period > limits.max_lookback_secs {
                return Err(lookback_exceeded("statsPeriod", limits));
            }
            let rollup = rollup as i64;
            let end = now.div_euclid(rollup) * rollup
                + if now.rem_euclid(rollup) == 0 { 0 } else { rollup };
            let start = i64::try_from(period)
                .ok()
                .and_then(|period| end.checked_sub(period))
                .ok_or_else(|| {
                    QueryError::invalid_param("statsPeriod", format!("Invalid statsPeriod: {}", raw))
                })?;
            representable(start, "statsPeriod")?;
            representable(end, "statsPeriod")?;
            (TimeRange::new_unchecked(start, end), "statsPeriod")
        }
    };

    if range.is_empty() {
        return Err(QueryError::invalid_param(
            param,
            format!("The time range {} is empty or inverted", range),
        ));
    }
    let earliest = i64::try_from(limits.max_lookback_secs)
        .map(|lookback| now.saturating_sub(lookback))
        .unwrap_or(i64::MIN);
    if range.start < earliest {
        return Err(lookback_exceeded(param, limits));
    }
    if range.duration_secs() % rollup as i64 != 0 {
        return Err(QueryError::invalid_param(
            "interval",
            format!(
                "interval of {}s does not evenly divide the {}s time range",
                rollup,
                range.duration_secs()
            ),
        ));
    }
    let points = range.duration_secs() as u64 / rollup;
    if points > limits.max_points {
        return Err(QueryError::invalid_param(
            "interval",
            format!(
                "Your interval and date range would create too many results ({} > {}); use a larger interval or a smaller date range",
                points, limits.max_points
            ),
        ));
    }
    Ok(range)
}

fn lookback_exceeded(param: &str, limits: &QueryLimits) -> QueryError {
    QueryError::invalid_param(
        param,
        format!(
            "The time range may not start more than {}s in the past",
            limits.max_lookback_secs
        ),
    )
}

fn resolve_scope(params: &RawQueryParams, scope: Scope) -> QueryResult<Scope> {
    if params.project.is_empty() {
        return Ok(scope);
    }
    let mut ids = Vec::with_capacity(params.project.len());
    for raw in &params.project {
        let id = raw.trim().parse::<u64>().map_err(|_| {
            QueryError::invalid_param("project", format!("Invalid project id: {}", raw))
        })?;
        if !scope.contains_project(id) {
            return Err(QueryError::invalid_param(
                "project",
                format!("Project {} is not accessible", id),
            ));
        }
        ids.push(id);
    }
    Ok(Scope::new(scope.organization_id, ids))
}
