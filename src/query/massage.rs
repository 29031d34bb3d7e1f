//! Result Massager
//!
//! Turns the raw totals and series row sets into the response shape: one
//! [`ResultGroup`] per group key, each carrying a scalar total and a dense
//! series for every requested field.
//!
//! ```text
//!   totals rows ─┐                      ┌─▶ group A: totals, series[grid]
//!                ├─▶ key union ─▶ sort ─┼─▶ group B: totals, series[grid]
//!   series rows ─┘                      └─▶ ...
//! ```
//!
//! A group seen in either row set appears in the output. Cells without a
//! store row take the field's fill value, so every series has exactly one
//! entry per bucket of the grid. When results are split by
//! `session.status`, each store row fans out into one group per status.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::metrics;
use crate::query::definition::{GroupByDimension, QueryDefinition, SessionStatus};
use crate::query::executor::{RawResults, RawRow};
use crate::query::grid::BucketGrid;
use crate::query::result::{FieldValue, GroupKey, GroupValue, ResultGroup, SessionsResult};

/// Values of the store group-by dimensions of a row, in declaration order
type StoreKey = Vec<GroupValue>;

/// Raw rows indexed by store key, series rows further by bucket index
struct RowIndex<'a> {
    totals: HashMap<StoreKey, &'a RawRow>,
    series: HashMap<StoreKey, Vec<Option<&'a RawRow>>>,
}

impl<'a> RowIndex<'a> {
    fn build(query: &QueryDefinition, raw: &'a RawResults, grid: &BucketGrid) -> Self {
        let dimensions = query.store_group_by();

        let mut totals = HashMap::with_capacity(raw.totals.len());
        for row in &raw.totals {
            totals.entry(store_key(&dimensions, row)).or_insert(row);
        }

        let mut series: HashMap<StoreKey, Vec<Option<&'a RawRow>>> = HashMap::new();
        let mut dropped = 0usize;
        for row in &raw.series {
            let Some(index) = row.bucket.and_then(|bucket| grid.index_of(bucket)) else {
                debug!(bucket = ?row.bucket, "Dropping series row outside the bucket grid");
                dropped += 1;
                continue;
            };
            let slots = match series.entry(store_key(&dimensions, row)) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(vec![None; grid.len()]),
            };
            // first row for a (key, bucket) wins
            if slots[index].is_none() {
                slots[index] = Some(row);
            }
        }

        if dropped > 0 {
            warn!(dropped, rows = raw.series.len(), "Series rows did not match the bucket grid");
            metrics::SERIES_ROWS_DROPPED.inc_by(dropped as u64);
        }

        Self { totals, series }
    }
}

fn store_key(dimensions: &[GroupByDimension], row: &RawRow) -> StoreKey {
    dimensions.iter().map(|dim| row.dimension(*dim)).collect()
}

/// Full group key: store values with the status inserted at its declared position
fn group_key(
    group_by: &[GroupByDimension],
    store_key: &[GroupValue],
    status: Option<SessionStatus>,
) -> GroupKey {
    let mut values = store_key.iter();
    let mut key = GroupKey::new();
    for dim in group_by {
        let value = match dim {
            GroupByDimension::SessionStatus => {
                GroupValue::text(status.map(SessionStatus::as_str).unwrap_or_default())
            }
            _ => values.next().cloned().unwrap_or_else(|| GroupValue::text("")),
        };
        key.push(*dim, value);
    }
    key
}

/// Merge raw totals and series rows into ordered result groups
///
/// The output is deterministic for a given input: groups are sorted by
/// [`GroupKey`] and the same rows always produce the same groups.
pub fn massage(query: &QueryDefinition, raw: &RawResults, grid: &BucketGrid) -> Vec<ResultGroup> {
    let index = RowIndex::build(query, raw, grid);
    let statuses: &[SessionStatus] = if query.is_split_by_status() {
        &SessionStatus::ALL
    } else {
        &[]
    };

    let mut keys: BTreeMap<GroupKey, (&StoreKey, Option<SessionStatus>)> = BTreeMap::new();
    for store_key in index.totals.keys().chain(index.series.keys()) {
        if statuses.is_empty() {
            keys.entry(group_key(query.group_by(), store_key, None))
                .or_insert((store_key, None));
        } else {
            for status in statuses {
                keys.entry(group_key(query.group_by(), store_key, Some(*status)))
                    .or_insert((store_key, Some(*status)));
            }
        }
    }

    keys.into_iter()
        .map(|(by, (store_key, status))| {
            let totals_row = index.totals.get(store_key).copied();
            let series_rows = index.series.get(store_key);

            let mut totals = BTreeMap::new();
            let mut series = BTreeMap::new();
            for field in query.fields() {
                let spec = field.spec();
                totals.insert(*field, spec.extract(totals_row, status));

                let points: Vec<FieldValue> = (0..grid.len())
                    .map(|i| spec.extract(series_rows.and_then(|rows| rows[i]), status))
                    .collect();
                assert_eq!(
                    points.len(),
                    grid.len(),
                    "series for {} in group {} does not match the grid",
                    field,
                    by
                );
                series.insert(*field, points);
            }

            ResultGroup { by, totals, series }
        })
        .collect()
}

/// Massage raw rows into the complete response
pub fn massage_sessions_result(
    query: &QueryDefinition,
    raw: &RawResults,
    grid: &BucketGrid,
) -> SessionsResult {
    let groups = massage(query, raw, grid);
    metrics::GROUPS_RETURNED.observe(groups.len() as f64);

    SessionsResult {
        start: query.start_datetime(),
        end: query.end_datetime(),
        query: query.query().to_string(),
        intervals: grid.intervals(),
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fields::{SessionField, StoreColumn};
    use crate::types::{to_datetime, Scope, TimeRange};

    const H: i64 = 3600;

    fn definition(group_by: Vec<GroupByDimension>, fields: Vec<SessionField>) -> QueryDefinition {
        QueryDefinition::try_new(
            Scope::new(1, vec![1, 2, 10]),
            TimeRange::new_unchecked(0, 4 * H),
            3600,
            group_by,
            fields,
            vec![],
        )
        .unwrap()
    }

    fn sessions(release: &str, count: u64) -> RawRow {
        RawRow::new()
            .with_release(release)
            .with_value(StoreColumn::Sessions, FieldValue::Count(count))
    }

    fn run(query: &QueryDefinition, raw: &RawResults) -> Vec<ResultGroup> {
        massage(query, raw, &BucketGrid::for_query(query))
    }

    fn release_key(release: &str) -> GroupKey {
        GroupKey::from_pairs(vec![(GroupByDimension::Release, GroupValue::text(release))])
    }

    #[test]
    fn test_fills_missing_buckets() {
        let query = definition(vec![GroupByDimension::Release], vec![SessionField::Sessions]);
        let raw = RawResults::new(
            vec![sessions("A", 10)],
            vec![sessions("A", 7).with_bucket(H), sessions("A", 3).with_bucket(3 * H)],
        );

        let groups = run(&query, &raw);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].by, release_key("A"));
        assert_eq!(groups[0].total(SessionField::Sessions), Some(FieldValue::Count(10)));
        assert_eq!(
            groups[0].series_of(SessionField::Sessions).unwrap(),
            &[
                FieldValue::Count(0),
                FieldValue::Count(7),
                FieldValue::Count(0),
                FieldValue::Count(3)
            ]
        );
    }

    #[test]
    fn test_empty_input() {
        let query = definition(vec![GroupByDimension::Release], vec![SessionField::Sessions]);
        assert!(run(&query, &RawResults::default()).is_empty());

        let split = definition(
            vec![GroupByDimension::SessionStatus],
            vec![SessionField::Sessions],
        );
        assert!(run(&split, &RawResults::default()).is_empty());
    }

    #[test]
    fn test_group_union() {
        let query = definition(vec![GroupByDimension::Release], vec![SessionField::Sessions]);
        let raw = RawResults::new(
            vec![sessions("B", 2)],
            vec![sessions("A", 1).with_bucket(0)],
        );

        let groups = run(&query, &raw);
        let keys: Vec<_> = groups.iter().map(|g| g.by.clone()).collect();
        assert_eq!(keys, vec![release_key("A"), release_key("B")]);

        // A has no totals row, B has no series rows
        assert_eq!(groups[0].total(SessionField::Sessions), Some(FieldValue::Count(0)));
        assert_eq!(
            groups[1].series_of(SessionField::Sessions).unwrap(),
            &[FieldValue::Count(0); 4]
        );
    }

    #[test]
    fn test_ordering() {
        let query = definition(
            vec![GroupByDimension::Project, GroupByDimension::Release],
            vec![SessionField::Sessions],
        );
        let row = |project, release: &str| sessions(release, 1).with_project(project);
        let raw = RawResults::new(
            vec![row(10, "a"), row(2, "b"), row(2, "B"), row(1, "z")],
            vec![],
        );

        let order: Vec<String> = run(&query, &raw).iter().map(|g| g.by.to_string()).collect();
        let expected: Vec<String> = [(1, "z"), (2, "B"), (2, "b"), (10, "a")]
            .iter()
            .map(|(p, r)| {
                GroupKey::from_pairs(vec![
                    (GroupByDimension::Project, GroupValue::Project(*p)),
                    (GroupByDimension::Release, GroupValue::text(*r)),
                ])
                .to_string()
            })
            .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_no_group_by() {
        let query = definition(vec![], vec![SessionField::Sessions, SessionField::Users]);
        let row = RawRow::new()
            .with_value(StoreColumn::Sessions, FieldValue::Count(5))
            .with_value(StoreColumn::Users, FieldValue::Count(2));
        let raw = RawResults::new(vec![row.clone()], vec![row.with_bucket(2 * H)]);

        let groups = run(&query, &raw);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].by.is_empty());
        assert_eq!(groups[0].total(SessionField::Users), Some(FieldValue::Count(2)));
        assert_eq!(
            groups[0].series_of(SessionField::Users).unwrap()[2],
            FieldValue::Count(2)
        );
    }

    #[test]
    fn test_status_split() {
        let query = definition(
            vec![GroupByDimension::Release, GroupByDimension::SessionStatus],
            vec![SessionField::Sessions, SessionField::DurationP50],
        );
        let row = RawRow::new()
            .with_release("1.0")
            .with_value(StoreColumn::Sessions, FieldValue::Count(10))
            .with_value(StoreColumn::SessionsErrored, FieldValue::Count(4))
            .with_value(StoreColumn::SessionsCrashed, FieldValue::Count(2))
            .with_value(StoreColumn::SessionsAbnormal, FieldValue::Count(1))
            .with_value(StoreColumn::DurationP50, FieldValue::Number(30.0));
        let raw = RawResults::new(vec![row], vec![]);

        let groups = run(&query, &raw);
        let statuses: Vec<_> = groups
            .iter()
            .map(|g| g.by.get(GroupByDimension::SessionStatus).unwrap().to_string())
            .collect();
        assert_eq!(statuses, vec!["abnormal", "crashed", "errored", "healthy"]);

        let counts: Vec<_> = groups
            .iter()
            .map(|g| g.total(SessionField::Sessions).unwrap())
            .collect();
        assert_eq!(
            counts,
            vec![
                FieldValue::Count(1),
                FieldValue::Count(2),
                FieldValue::Count(1),
                FieldValue::Count(6)
            ]
        );

        let durations: Vec<_> = groups
            .iter()
            .map(|g| g.total(SessionField::DurationP50).unwrap())
            .collect();
        assert!(durations[..3].iter().all(FieldValue::is_undefined));
        assert_eq!(durations[3], FieldValue::Number(30.0));
    }

    #[test]
    fn test_status_position_follows_declaration() {
        let query = definition(
            vec![GroupByDimension::SessionStatus, GroupByDimension::Release],
            vec![SessionField::Sessions],
        );
        let raw = RawResults::new(vec![sessions("x", 1), sessions("a", 1)], vec![]);

        let groups = run(&query, &raw);
        assert_eq!(groups.len(), 8);
        let first = &groups[0].by;
        assert_eq!(
            first.iter().map(|(d, _)| *d).collect::<Vec<_>>(),
            vec![GroupByDimension::SessionStatus, GroupByDimension::Release]
        );
        assert_eq!(
            groups[1].by.get(GroupByDimension::SessionStatus),
            Some(&GroupValue::text("abnormal"))
        );
        assert_eq!(
            groups[1].by.get(GroupByDimension::Release),
            Some(&GroupValue::text("x"))
        );
    }

    #[test]
    fn test_ratio_and_duration_fill_undefined() {
        let query = definition(
            vec![GroupByDimension::Release],
            vec![SessionField::CrashFreeSessions, SessionField::DurationAvg],
        );
        let row = sessions("A", 4).with_value(StoreColumn::SessionsCrashed, FieldValue::Count(1));
        let raw = RawResults::new(vec![row.clone()], vec![row.with_bucket(0)]);

        let groups = run(&query, &raw);
        let rate = groups[0].series_of(SessionField::CrashFreeSessions).unwrap();
        assert_eq!(rate[0], FieldValue::Number(0.75));
        assert!(rate[1..].iter().all(FieldValue::is_undefined));
        assert!(groups[0]
            .series_of(SessionField::DurationAvg)
            .unwrap()
            .iter()
            .all(FieldValue::is_undefined));
    }

    #[test]
    fn test_drops_rows_outside_grid() {
        let query = definition(vec![GroupByDimension::Release], vec![SessionField::Sessions]);
        let raw = RawResults::new(
            vec![],
            vec![
                sessions("A", 1).with_bucket(-H),
                sessions("A", 2).with_bucket(4 * H),
                sessions("A", 3).with_bucket(H + 1),
                sessions("A", 4),
                sessions("A", 5).with_bucket(2 * H),
            ],
        );

        let groups = run(&query, &raw);
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].series_of(SessionField::Sessions).unwrap(),
            &[
                FieldValue::Count(0),
                FieldValue::Count(0),
                FieldValue::Count(5),
                FieldValue::Count(0)
            ]
        );
    }

    #[test]
    fn test_duplicate_rows_keep_first() {
        let query = definition(vec![GroupByDimension::Release], vec![SessionField::Sessions]);
        let raw = RawResults::new(
            vec![sessions("A", 1), sessions("A", 9)],
            vec![sessions("A", 2).with_bucket(0), sessions("A", 8).with_bucket(0)],
        );

        let groups = run(&query, &raw);
        assert_eq!(groups[0].total(SessionField::Sessions), Some(FieldValue::Count(1)));
        assert_eq!(
            groups[0].series_of(SessionField::Sessions).unwrap()[0],
            FieldValue::Count(2)
        );
    }

    #[test]
    fn test_idempotent() {
        let query = definition(
            vec![GroupByDimension::Release, GroupByDimension::SessionStatus],
            vec![SessionField::Sessions, SessionField::Users],
        );
        let raw = RawResults::new(
            vec![sessions("b", 3), sessions("a", 1)],
            vec![sessions("c", 2).with_bucket(H)],
        );
        let grid = BucketGrid::for_query(&query);
        assert_eq!(massage(&query, &raw, &grid), massage(&query, &raw, &grid));
    }

    #[test]
    fn test_sessions_result() {
        let query = definition(vec![GroupByDimension::Release], vec![SessionField::Sessions]);
        let raw = RawResults::new(vec![sessions("A", 10)], vec![]);
        let grid = BucketGrid::for_query(&query);

        let result = massage_sessions_result(&query, &raw, &grid);
        assert_eq!(result.start, to_datetime(0).unwrap());
        assert_eq!(result.end, to_datetime(4 * H).unwrap());
        assert_eq!(result.intervals.len(), 4);
        assert_eq!(result.groups.len(), 1);
        assert!(result.group(&release_key("A")).is_some());
    }
}
