//! In-memory session store
//!
//! Keeps individual session records and answers aggregate queries by
//! scanning them. Suited to tests, demos and small embedded deployments.
//!
//! # Example
//!
//! ```rust
//! use release_health::query::SessionStatus;
//! use release_health::storage::{InMemorySessionStore, SessionRecord};
//!
//! let store = InMemorySessionStore::new();
//! store.insert(
//!     1,
//!     SessionRecord::new(42, "app@1.0", 1_614_556_800)
//!         .with_status(SessionStatus::Crashed)
//!         .with_user("u-1"),
//! );
//! assert_eq!(store.len(), 1);
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::error::StoreError;
use crate::query::definition::{GroupByDimension, SessionStatus};
use crate::query::executor::{RawRow, SessionStore, StoreQuery};
use crate::query::fields::StoreColumn;
use crate::query::result::{FieldValue, GroupValue};
use crate::types::{OrganizationId, ProjectId, Timestamp};

/// One finished session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Owning project
    pub project: ProjectId,
    /// Release the session ran
    pub release: String,
    /// Deployment environment
    pub environment: String,
    /// Session start, unix seconds
    pub started: Timestamp,
    /// Final status
    pub status: SessionStatus,
    /// Distinct user id, if known
    pub user: Option<String>,
    /// Duration in seconds, if known
    pub duration: Option<f64>,
}

impl SessionRecord {
    /// Healthy session in the `production` environment
    pub fn new(project: ProjectId, release: impl Into<String>, started: Timestamp) -> Self {
        Self {
            project,
            release: release.into(),
            environment: "production".to_string(),
            started,
            status: SessionStatus::Healthy,
            user: None,
            duration: None,
        }
    }

    /// Set the environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the final status
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the user id
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the duration
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    fn dimension(&self, dimension: GroupByDimension) -> GroupValue {
        match dimension {
            GroupByDimension::Project => GroupValue::Project(self.project),
            GroupByDimension::Release => GroupValue::text(self.release.as_str()),
            GroupByDimension::Environment => GroupValue::text(self.environment.as_str()),
            GroupByDimension::SessionStatus => GroupValue::text(self.status.as_str()),
        }
    }
}

/// Per-group accumulator
#[derive(Default)]
struct Aggregate {
    sessions: u64,
    errored: u64,
    crashed: u64,
    abnormal: u64,
    users: HashSet<String>,
    users_errored: HashSet<String>,
    users_crashed: HashSet<String>,
    users_abnormal: HashSet<String>,
    /// Durations of healthy sessions
    durations: Vec<f64>,
}

impl Aggregate {
    fn add(&mut self, record: &SessionRecord) {
        self.sessions += 1;
        let unhealthy = record.status != SessionStatus::Healthy;
        if unhealthy {
            self.errored += 1;
        }
        match record.status {
            SessionStatus::Crashed => self.crashed += 1,
            SessionStatus::Abnormal => self.abnormal += 1,
            _ => {}
        }

        if let Some(user) = &record.user {
            self.users.insert(user.clone());
            if unhealthy {
                self.users_errored.insert(user.clone());
            }
            match record.status {
                SessionStatus::Crashed => {
                    self.users_crashed.insert(user.clone());
                }
                SessionStatus::Abnormal => {
                    self.users_abnormal.insert(user.clone());
                }
                _ => {}
            }
        }

        if record.status == SessionStatus::Healthy {
            if let Some(duration) = record.duration.filter(|d| d.is_finite()) {
                self.durations.push(duration);
            }
        }
    }

    fn value(&mut self, column: StoreColumn) -> FieldValue {
        match column {
            StoreColumn::Sessions => FieldValue::Count(self.sessions),
            StoreColumn::SessionsErrored => FieldValue::Count(self.errored),
            StoreColumn::SessionsCrashed => FieldValue::Count(self.crashed),
            StoreColumn::SessionsAbnormal => FieldValue::Count(self.abnormal),
            StoreColumn::Users => FieldValue::Count(self.users.len() as u64),
            StoreColumn::UsersErrored => FieldValue::Count(self.users_errored.len() as u64),
            StoreColumn::UsersCrashed => FieldValue::Count(self.users_crashed.len() as u64),
            StoreColumn::UsersAbnormal => FieldValue::Count(self.users_abnormal.len() as u64),
            StoreColumn::DurationAvg => {
                let sum: f64 = self.durations.iter().sum();
                FieldValue::from(
                    (!self.durations.is_empty()).then(|| sum / self.durations.len() as f64),
                )
            }
            quantile_column => {
                FieldValue::from(quantile_column.quantile().and_then(|q| self.quantile(q)))
            }
        }
    }

    /// Nearest-rank quantile of the healthy durations
    fn quantile(&mut self, q: f64) -> Option<f64> {
        if self.durations.is_empty() {
            return None;
        }
        self.durations.sort_by(f64::total_cmp);
        let n = self.durations.len();
        let rank = ((q * n as f64).ceil() as usize).clamp(1, n);
        Some(self.durations[rank - 1])
    }
}

/// Session store backed by in-memory records
#[derive(Default)]
pub struct InMemorySessionStore {
    records: RwLock<HashMap<OrganizationId, Vec<SessionRecord>>>,
}

impl InMemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session record
    pub fn insert(&self, organization_id: OrganizationId, record: SessionRecord) {
        self.records
            .write()
            .entry(organization_id)
            .or_default()
            .push(record);
    }

    /// Add many session records
    pub fn extend(
        &self,
        organization_id: OrganizationId,
        records: impl IntoIterator<Item = SessionRecord>,
    ) {
        self.records
            .write()
            .entry(organization_id)
            .or_default()
            .extend(records);
    }

    /// Total number of records
    pub fn len(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }

    /// Check if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn aggregate(&self, request: &StoreQuery) -> Result<Vec<RawRow>, StoreError> {
        let granularity = match request.granularity {
            Some(0) => {
                return Err(StoreError::InvalidQuery(
                    "granularity must be > 0".to_string(),
                ))
            }
            Some(g) => Some(g as i64),
            None => None,
        };
        if let Some(dim) = request.group_by.iter().find(|d| !d.is_store_column()) {
            return Err(StoreError::InvalidQuery(format!("cannot group by {}", dim)));
        }

        let records = self.records.read();
        let Some(records) = records.get(&request.organization_id) else {
            return Ok(Vec::new());
        };

        let mut groups: BTreeMap<(Vec<GroupValue>, Option<Timestamp>), Aggregate> =
            BTreeMap::new();
        for record in records.iter().filter(|r| {
            request.project_ids.binary_search(&r.project).is_ok()
                && request.range.contains(r.started)
                && request
                    .filters
                    .iter()
                    .all(|f| f.matches(&r.dimension(f.dimension)))
        }) {
            let key = request
                .group_by
                .iter()
                .map(|dim| record.dimension(*dim))
                .collect();
            let bucket = granularity.map(|g| {
                request.range.start + (record.started - request.range.start) / g * g
            });
            groups.entry((key, bucket)).or_default().add(record);
        }

        Ok(groups
            .into_iter()
            .map(|((key, bucket), mut aggregate)| {
                let mut row = RawRow::new();
                for (dim, value) in request.group_by.iter().zip(key) {
                    match (dim, value) {
                        (GroupByDimension::Project, GroupValue::Project(id)) => row.project = Some(id),
                        (GroupByDimension::Release, value) => row.release = Some(value.to_string()),
                        (GroupByDimension::Environment, value) => {
                            row.environment = Some(value.to_string())
                        }
                        _ => {}
                    }
                }
                row.bucket = bucket;
                for column in &request.columns {
                    row.set(*column, aggregate.value(*column));
                }
                row
            })
            .collect())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn store_id(&self) -> &str {
        "memory"
    }

    async fn query(&self, request: StoreQuery) -> Result<Vec<RawRow>, StoreError> {
        if request.is_expired() {
            return Err(StoreError::Timeout);
        }
        let rows = self.aggregate(&request)?;
        if request.is_expired() {
            return Err(StoreError::Timeout);
        }
        debug!(kind = %request.kind, rows = rows.len(), "In-memory query finished");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::definition::Filter;
    use crate::query::executor::QueryKind;
    use crate::types::TimeRange;
    use std::time::{Duration, Instant};

    const H: i64 = 3600;

    fn request(kind: QueryKind, group_by: Vec<GroupByDimension>, columns: Vec<StoreColumn>) -> StoreQuery {
        StoreQuery {
            kind,
            organization_id: 1,
            project_ids: vec![1, 2],
            range: TimeRange::new_unchecked(0, 4 * H),
            granularity: (kind == QueryKind::Series).then_some(3600),
            group_by,
            columns,
            filters: vec![],
            deadline: None,
        }
    }

    fn store() -> InMemorySessionStore {
        let store = InMemorySessionStore::new();
        store.extend(
            1,
            vec![
                SessionRecord::new(1, "1.0", 10).with_user("a").with_duration(10.0),
                SessionRecord::new(1, "1.0", 20).with_user("a").with_duration(30.0),
                SessionRecord::new(1, "1.0", H + 5)
                    .with_user("b")
                    .with_status(SessionStatus::Crashed)
                    .with_duration(999.0),
                SessionRecord::new(1, "2.0", 2 * H)
                    .with_user("b")
                    .with_status(SessionStatus::Errored),
                SessionRecord::new(2, "2.0", 3 * H)
                    .with_environment("staging")
                    .with_status(SessionStatus::Abnormal),
                // outside scope or range
                SessionRecord::new(3, "1.0", 10),
                SessionRecord::new(1, "1.0", 4 * H),
            ],
        );
        store.insert(2, SessionRecord::new(1, "1.0", 10));
        store
    }

    #[tokio::test]
    async fn test_totals() {
        let rows = store()
            .query(request(
                QueryKind::Totals,
                vec![],
                vec![
                    StoreColumn::Sessions,
                    StoreColumn::SessionsErrored,
                    StoreColumn::SessionsCrashed,
                    StoreColumn::SessionsAbnormal,
                    StoreColumn::Users,
                    StoreColumn::UsersErrored,
                    StoreColumn::UsersCrashed,
                ],
            ))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.bucket, None);
        assert_eq!(row.get(StoreColumn::Sessions), FieldValue::Count(5));
        assert_eq!(row.get(StoreColumn::SessionsErrored), FieldValue::Count(3));
        assert_eq!(row.get(StoreColumn::SessionsCrashed), FieldValue::Count(1));
        assert_eq!(row.get(StoreColumn::SessionsAbnormal), FieldValue::Count(1));
        assert_eq!(row.get(StoreColumn::Users), FieldValue::Count(2));
        assert_eq!(row.get(StoreColumn::UsersErrored), FieldValue::Count(1));
        assert_eq!(row.get(StoreColumn::UsersCrashed), FieldValue::Count(1));
        // not requested
        assert!(row.get(StoreColumn::DurationAvg).is_undefined());
    }

    #[tokio::test]
    async fn test_series_grouped() {
        let rows = store()
            .query(request(
                QueryKind::Series,
                vec![GroupByDimension::Release],
                vec![StoreColumn::Sessions],
            ))
            .await
            .unwrap();
        let cells: Vec<(Option<String>, Option<Timestamp>, FieldValue)> = rows
            .iter()
            .map(|r| (r.release.clone(), r.bucket, r.get(StoreColumn::Sessions)))
            .collect();
        assert_eq!(
            cells,
            vec![
                (Some("1.0".into()), Some(0), FieldValue::Count(2)),
                (Some("1.0".into()), Some(H), FieldValue::Count(1)),
                (Some("2.0".into()), Some(2 * H), FieldValue::Count(1)),
                (Some("2.0".into()), Some(3 * H), FieldValue::Count(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_durations_healthy_only() {
        let rows = store()
            .query(request(
                QueryKind::Totals,
                vec![],
                vec![
                    StoreColumn::DurationAvg,
                    StoreColumn::DurationP50,
                    StoreColumn::DurationMax,
                ],
            ))
            .await
            .unwrap();
        assert_eq!(rows[0].get(StoreColumn::DurationAvg), FieldValue::Number(20.0));
        assert_eq!(rows[0].get(StoreColumn::DurationP50), FieldValue::Number(10.0));
        assert_eq!(rows[0].get(StoreColumn::DurationMax), FieldValue::Number(30.0));
    }

    #[tokio::test]
    async fn test_filters() {
        let mut req = request(
            QueryKind::Totals,
            vec![GroupByDimension::Project],
            vec![StoreColumn::Sessions],
        );
        req.filters = vec![Filter::exclude(
            GroupByDimension::Environment,
            vec![GroupValue::text("staging")],
        )];
        let rows = store().query(req).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].project, Some(1));
        assert_eq!(rows[0].get(StoreColumn::Sessions), FieldValue::Count(4));
    }

    #[tokio::test]
    async fn test_unknown_organization() {
        let mut req = request(QueryKind::Totals, vec![], vec![StoreColumn::Sessions]);
        req.organization_id = 99;
        assert!(store().query(req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deadline() {
        let mut req = request(QueryKind::Totals, vec![], vec![StoreColumn::Sessions]);
        req.deadline = Some(Instant::now() - Duration::from_millis(1));
        assert_eq!(store().query(req).await.unwrap_err(), StoreError::Timeout);
    }

    #[tokio::test]
    async fn test_rejects_status_group_by() {
        let req = request(
            QueryKind::Totals,
            vec![GroupByDimension::SessionStatus],
            vec![StoreColumn::Sessions],
        );
        assert!(matches!(
            store().query(req).await,
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_nearest_rank_quantile() {
        let mut agg = Aggregate {
            durations: vec![5.0, 1.0, 4.0, 2.0, 3.0],
            ..Aggregate::default()
        };
        assert_eq!(agg.quantile(0.5), Some(3.0));
        assert_eq!(agg.quantile(0.9), Some(5.0));
        assert_eq!(agg.quantile(0.0), Some(1.0));
        assert_eq!(Aggregate::default().quantile(0.5), None);
    }
}
