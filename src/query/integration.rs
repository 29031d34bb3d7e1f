//! Query Integration Module
//!
//! Wires the pipeline stages into a single entry point:
//!
//! ```text
//! RawQueryParams + Scope
//!   │
//!   ├─► build_sessions_query   ─► QueryDefinition + BucketGrid
//!   │
//!   ├─► run_sessions_query     ─► RawResults (totals ∥ series)
//!   │
//!   └─► massage_sessions_result ─► SessionsResult
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::Config;
use crate::metrics;
use crate::query::definition::{QueryDefinition, QueryLimits};
use crate::query::error::QueryResult;
use crate::query::executor::{ExecutorConfig, QueryExecutor, SessionStore};
use crate::query::grid::BucketGrid;
use crate::query::massage::massage_sessions_result;
use crate::query::params::RawQueryParams;
use crate::query::result::SessionsResult;
use crate::types::Scope;

/// Sessions query engine over a session store
///
/// One engine serves any number of concurrent requests; each request runs
/// as an independent pipeline.
pub struct SessionsEngine<S: SessionStore> {
    /// Store query executor
    executor: QueryExecutor<S>,

    /// Request validation limits
    limits: QueryLimits,

    /// Record query metrics
    metrics_enabled: bool,
}

impl<S: SessionStore> SessionsEngine<S> {
    /// Create an engine with default configuration
    pub fn new(store: Arc<S>) -> Self {
        Self {
            executor: QueryExecutor::new(store),
            limits: QueryLimits::default(),
            metrics_enabled: true,
        }
    }

    /// Apply a configuration
    ///
    /// Fails if the configuration does not validate.
    pub fn with_config(self, config: Config) -> Result<Self, String> {
        config.validate()?;
        Ok(Self {
            executor: QueryExecutor::with_config(
                self.executor.store().clone(),
                config.executor.to_executor_config(),
            ),
            limits: config.limits,
            metrics_enabled: config.monitoring.metrics_enabled,
        })
    }

    /// Replace the executor configuration only
    pub fn with_executor_config(self, config: ExecutorConfig) -> Self {
        Self {
            executor: QueryExecutor::with_config(self.executor.store().clone(), config),
            ..self
        }
    }

    /// Validation limits in effect
    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    /// Backing store
    pub fn store(&self) -> &Arc<S> {
        self.executor.store()
    }

    /// Validate request parameters against the current time
    pub fn build_query(&self, scope: Scope, params: &RawQueryParams) -> QueryResult<QueryDefinition> {
        QueryDefinition::from_params(params, scope, &self.limits, Utc::now())
    }

    /// Run a sessions query against the current time
    pub async fn query(&self, scope: Scope, params: &RawQueryParams) -> QueryResult<SessionsResult> {
        self.query_at(scope, params, Utc::now()).await
    }

    /// Run a sessions query with an explicit `now`
    pub async fn query_at(
        &self,
        scope: Scope,
        params: &RawQueryParams,
        now: DateTime<Utc>,
    ) -> QueryResult<SessionsResult> {
        let started = Instant::now();
        let result = self.run(scope, params, now).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_client_error() => "invalid",
            Err(e) => {
                warn!(error = %e, "Sessions query failed");
                "error"
            }
        };
        if self.metrics_enabled {
            metrics::record_query(outcome, started.elapsed().as_secs_f64());
        }
        result
    }

    async fn run(
        &self,
        scope: Scope,
        params: &RawQueryParams,
        now: DateTime<Utc>,
    ) -> QueryResult<SessionsResult> {
        let organization_id = scope.organization_id;
        let (query, grid) = info_span!("build_sessions_query", organization_id).in_scope(|| {
            let query = QueryDefinition::from_params(params, scope, &self.limits, now)?;
            let grid = BucketGrid::for_query(&query);
            debug!(
                range = %query.range(),
                rollup = query.rollup(),
                buckets = grid.len(),
                fields = query.fields().len(),
                "Built sessions query"
            );
            QueryResult::Ok((query, grid))
        })?;

        let raw = self
            .executor
            .execute(&query)
            .instrument(info_span!("run_sessions_query", organization_id))
            .await?;

        let result = info_span!("massage_sessions_result", organization_id).in_scope(|| {
            massage_sessions_result(&query, &raw, &grid)
        });
        debug!(groups = result.groups.len(), "Sessions query finished");
        Ok(result)
    }
}
