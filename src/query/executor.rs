//! Query Executor
//!
//! Issues the two store queries behind every sessions request:
//!
//! ```text
//!                    QueryDefinition
//!                          │
//!            ┌─────────────┴─────────────┐
//!            ▼                           ▼
//!   ┌─────────────────┐         ┌─────────────────┐
//!   │  Totals query   │         │  Series query   │
//!   │ (whole range)   │         │ (+ bucket)      │
//!   └────────┬────────┘         └────────┬────────┘
//!            │        try_join!          │
//!            └─────────────┬─────────────┘
//!                          ▼
//!                     RawResults
//! ```
//!
//! Both queries share scope, time bounds, group-by columns, aggregate
//! columns and filters, so their group keys line up. They run concurrently
//! by default; the first failure fails the whole request and drops the
//! other in-flight query. Store errors are passed through as the source of
//! an execution error. There are no retries and no caching at this layer.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::metrics;
use crate::query::definition::{Filter, GroupByDimension, QueryDefinition};
use crate::query::error::{QueryError, QueryResult};
use crate::query::fields::StoreColumn;
use crate::query::result::{FieldValue, GroupValue};
use crate::types::{OrganizationId, ProjectId, TimeRange, Timestamp};

// ============================================================================
// Store contract
// ============================================================================

/// Which of the two queries a request is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Collapsed over the whole range
    Totals,
    /// Grouped additionally by bucket
    Series,
}

impl QueryKind {
    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Totals => "totals",
            QueryKind::Series => "series",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate query sent to a session store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreQuery {
    /// Totals or series
    pub kind: QueryKind,
    /// Organization being queried
    pub organization_id: OrganizationId,
    /// Projects to include
    pub project_ids: Vec<ProjectId>,
    /// Half-open time range
    pub range: TimeRange,
    /// Bucket width in seconds; set for series queries only
    pub granularity: Option<u64>,
    /// Store dimensions to group by, in declaration order
    pub group_by: Vec<GroupByDimension>,
    /// Aggregate columns to compute
    pub columns: Vec<StoreColumn>,
    /// Filter predicates, combined with AND
    pub filters: Vec<Filter>,
    /// Point after which the store should abandon the query
    pub deadline: Option<Instant>,
}

impl StoreQuery {
    fn from_definition(
        kind: QueryKind,
        query: &QueryDefinition,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            kind,
            organization_id: query.scope().organization_id,
            project_ids: query.scope().project_ids.clone(),
            range: query.range(),
            granularity: match kind {
                QueryKind::Totals => None,
                QueryKind::Series => Some(query.rollup()),
            },
            group_by: query.store_group_by(),
            columns: query.store_columns(),
            filters: query.filters().to_vec(),
            deadline,
        }
    }

    /// Totals query for a definition
    pub fn totals(query: &QueryDefinition, deadline: Option<Instant>) -> Self {
        Self::from_definition(QueryKind::Totals, query, deadline)
    }

    /// Series query for a definition
    pub fn series(query: &QueryDefinition, deadline: Option<Instant>) -> Self {
        Self::from_definition(QueryKind::Series, query, deadline)
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// One row returned by a session store
///
/// Dimension values are set for the dimensions the query grouped by;
/// `bucket` is set on series rows only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    /// Project id
    pub project: Option<ProjectId>,
    /// Release name
    pub release: Option<String>,
    /// Environment name
    pub environment: Option<String>,
    /// Bucket start (series rows)
    pub bucket: Option<Timestamp>,
    values: BTreeMap<StoreColumn, FieldValue>,
}

impl RawRow {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the project
    pub fn with_project(mut self, project: ProjectId) -> Self {
        self.project = Some(project);
        self
    }

    /// Set the release
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    /// Set the environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Set the bucket start
    pub fn with_bucket(mut self, bucket: Timestamp) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Set a column value
    pub fn with_value(mut self, column: StoreColumn, value: FieldValue) -> Self {
        self.set(column, value);
        self
    }

    /// Set a column value in place
    pub fn set(&mut self, column: StoreColumn, value: FieldValue) {
        self.values.insert(column, value);
    }

    /// Column value; `Undefined` when the store did not return the column
    pub fn get(&self, column: StoreColumn) -> FieldValue {
        self.values
            .get(&column)
            .copied()
            .unwrap_or(FieldValue::Undefined)
    }

    /// Group value for a store dimension
    ///
    /// A dimension the store left unset reads as the empty string.
    pub fn dimension(&self, dimension: GroupByDimension) -> GroupValue {
        match dimension {
            GroupByDimension::Project => match self.project {
                Some(id) => GroupValue::Project(id),
                None => GroupValue::text(""),
            },
            GroupByDimension::Release => GroupValue::text(self.release.clone().unwrap_or_default()),
            GroupByDimension::Environment => {
                GroupValue::text(self.environment.clone().unwrap_or_default())
            }
            GroupByDimension::SessionStatus => GroupValue::text(""),
        }
    }
}

/// Storage backend answering aggregate session queries
///
/// Implementations own their retry, caching and cancellation policies. A
/// query future that is dropped must stop work cooperatively.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Identifier used in logs
    fn store_id(&self) -> &str;

    /// Run one aggregate query
    async fn query(&self, request: StoreQuery) -> Result<Vec<RawRow>, StoreError>;
}

// ============================================================================
// Executor Configuration
// ============================================================================

/// Configuration for query execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Deadline handed to the store, relative to the start of execution
    /// (default: 30 seconds)
    pub timeout: Option<Duration>,

    /// Issue the totals and series queries concurrently (default: true)
    pub parallel: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            parallel: true,
        }
    }
}

impl ExecutorConfig {
    /// Create a new executor config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Hand no deadline to the store
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Run the two queries one after the other
    pub fn without_parallel(mut self) -> Self {
        self.parallel = false;
        self
    }
}

// ============================================================================
// Query Executor
// ============================================================================

/// Raw row sets of one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResults {
    /// Rows of the totals query
    pub totals: Vec<RawRow>,
    /// Rows of the series query
    pub series: Vec<RawRow>,
}

impl RawResults {
    /// Create from both row sets
    pub fn new(totals: Vec<RawRow>, series: Vec<RawRow>) -> Self {
        Self { totals, series }
    }

    /// Check if neither query returned rows
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty() && self.series.is_empty()
    }
}

/// Runs query definitions against a session store
pub struct QueryExecutor<S: SessionStore> {
    /// Backing store
    store: Arc<S>,

    /// Executor configuration
    config: ExecutorConfig,
}

impl<S: SessionStore> QueryExecutor<S> {
    /// Create an executor with default configuration
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    /// Create an executor with custom configuration
    pub fn with_config(store: Arc<S>, config: ExecutorConfig) -> Self {
        Self { store, config }
    }

    /// Executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Backing store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run the totals and series queries of a definition
    pub async fn execute(&self, query: &QueryDefinition) -> QueryResult<RawResults> {
        let deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
        self.execute_with_deadline(query, deadline).await
    }

    /// Run both queries with an explicit deadline passed through to the store
    pub async fn execute_with_deadline(
        &self,
        query: &QueryDefinition,
        deadline: Option<Instant>,
    ) -> QueryResult<RawResults> {
        let totals = StoreQuery::totals(query, deadline);
        let series = StoreQuery::series(query, deadline);

        debug!(
            store = self.store.store_id(),
            range = %query.range(),
            rollup = query.rollup(),
            columns = totals.columns.len(),
            parallel = self.config.parallel,
            "Executing sessions queries"
        );

        let (totals, series) = if self.config.parallel {
            tokio::try_join!(self.run(totals), self.run(series))?
        } else {
            let totals = self.run(totals).await?;
            let series = self.run(series).await?;
            (totals, series)
        };

        Ok(RawResults { totals, series })
    }

    async fn run(&self, request: StoreQuery) -> QueryResult<Vec<RawRow>> {
        let kind = request.kind;
        let timer = metrics::STORE_QUERY_DURATION
            .with_label_values(&[kind.as_str()])
            .start_timer();
        let result = self.store.query(request).await;
        timer.observe_duration();

        match result {
            Ok(rows) => {
                debug!(store = self.store.store_id(), kind = %kind, rows = rows.len(), "Store query finished");
                Ok(rows)
            }
            Err(e) => {
                warn!(store = self.store.store_id(), kind = %kind, error = %e, "Store query failed");
                Err(QueryError::execution(format!("{} query failed: {}", kind, e)).with_source(e))
            }
        }
    }
}
