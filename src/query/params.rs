//! Raw request parameters and their parsers
//!
//! [`RawQueryParams`] mirrors the sessions query string as received at the
//! boundary: every value is still an unvalidated string. The helpers here
//! turn durations, timestamps and search queries into typed values; the
//! validation rules themselves live in [`QueryDefinition::from_params`].
//!
//! # Supported formats
//!
//! - Durations: `"90"` (seconds), `"30s"`, `"15m"`, `"1h"`, `"14d"`, `"2w"`
//! - Timestamps: RFC 3339 (`2021-03-01T00:00:00Z`), naive ISO 8601 read as
//!   UTC (`2021-03-01T00:00:00`), or unix seconds
//! - Search query: whitespace separated `key:value` and `!key:value` terms,
//!   values optionally double-quoted
//!
//! [`QueryDefinition::from_params`]: crate::query::QueryDefinition::from_params

use chrono::{DateTime, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::query::definition::{Filter, GroupByDimension};
use crate::query::error::{QueryError, QueryResult};
use crate::query::result::GroupValue;
use crate::types::Timestamp;

lazy_static! {
    static ref DURATION_RE: Regex =
        Regex::new(r"^(\d+)([smhdw]?)$").expect("duration pattern is valid");
}

/// Unvalidated request parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawQueryParams {
    /// Absolute range start
    pub start: Option<String>,
    /// Absolute range end
    pub end: Option<String>,
    /// Relative period ending now
    pub stats_period: Option<String>,
    /// Rollup interval
    pub interval: Option<String>,
    /// Group-by dimension names
    pub group_by: Vec<String>,
    /// Requested field names
    pub field: Vec<String>,
    /// Project ids narrowing the scope
    pub project: Vec<String>,
    /// Environment names to include
    pub environment: Vec<String>,
    /// Search query
    pub query: Option<String>,
}

impl RawQueryParams {
    /// Build from decoded query-string pairs
    ///
    /// List parameters (`field`, `groupBy`, `project`, `environment`)
    /// accumulate across repeated keys; for scalar parameters the last value
    /// wins. Unknown keys are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let value = value.into();
            match key.as_ref() {
                "start" => params.start = Some(value),
                "end" => params.end = Some(value),
                "statsPeriod" => params.stats_period = Some(value),
                "interval" => params.interval = Some(value),
                "groupBy" => params.group_by.push(value),
                "field" => params.field.push(value),
                "project" => params.project.push(value),
                "environment" => params.environment.push(value),
                "query" => params.query = Some(value),
                _ => {}
            }
        }
        params
    }

    /// Add a requested field
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field.push(field.into());
        self
    }

    /// Add a group-by dimension
    pub fn with_group_by(mut self, dimension: impl Into<String>) -> Self {
        self.group_by.push(dimension.into());
        self
    }

    /// Set an absolute range
    pub fn with_range(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.start = Some(start.into());
        self.end = Some(end.into());
        self
    }

    /// Set a relative period
    pub fn with_stats_period(mut self, period: impl Into<String>) -> Self {
        self.stats_period = Some(period.into());
        self
    }

    /// Set the rollup interval
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    /// Add a project id
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project.push(project.into());
        self
    }

    /// Add an environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment.push(environment.into());
        self
    }

    /// Set the search query
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// Parse a duration like `"1h"` or `"3600"` into seconds
pub fn parse_duration(value: &str) -> Option<u64> {
    let caps = DURATION_RE.captures(value.trim())?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = match caps.get(2).map(|m| m.as_str()).unwrap_or("") {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    amount.checked_mul(unit)
}

/// Parse an absolute timestamp into unix seconds
pub fn parse_timestamp(value: &str) -> Option<Timestamp> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return Some(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Parse a search query into filters
///
/// Terms on the same key are combined with AND.
pub fn parse_search_query(query: &str) -> QueryResult<Vec<Filter>> {
    tokenize(query)?
        .into_iter()
        .map(|term| parse_term(&term))
        .collect()
}

fn tokenize(query: &str) -> QueryResult<Vec<String>> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in query.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(QueryError::invalid_param(
            "query",
            "Unterminated quote in query",
        ));
    }
    if !current.is_empty() {
        terms.push(current);
    }
    Ok(terms)
}

fn parse_term(term: &str) -> QueryResult<Filter> {
    let (negated, term) = match term.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, term),
    };
    let (key, value) = term.split_once(':').ok_or_else(|| {
        QueryError::invalid_param("query", format!("Expected key:value, got '{}'", term))
    })?;

    let dimension = match key {
        "release" => GroupByDimension::Release,
        "environment" => GroupByDimension::Environment,
        "project" | "project.id" => GroupByDimension::Project,
        other => {
            return Err(QueryError::invalid_param(
                "query",
                format!("Cannot filter by {}", other),
            ))
        }
    };
    let value = match dimension {
        GroupByDimension::Project => GroupValue::Project(value.parse().map_err(|_| {
            QueryError::invalid_param("query", format!("Invalid project id: {}", value))
        })?),
        _ => GroupValue::text(value),
    };

    Ok(if negated {
        Filter::exclude(dimension, vec![value])
    } else {
        Filter::include(dimension, vec![value])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600"), Some(3600));
        assert_eq!(parse_duration("30s"), Some(30));
        assert_eq!(parse_duration("15m"), Some(900));
        assert_eq!(parse_duration("1h"), Some(3600));
        assert_eq!(parse_duration("14d"), Some(14 * 86_400));
        assert_eq!(parse_duration("2w"), Some(1_209_600));
        assert_eq!(parse_duration(" 1h "), Some(3600));
        assert_eq!(parse_duration("1y"), None);
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("-1h"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1614556800"), Some(1_614_556_800));
        assert_eq!(parse_timestamp("2021-03-01T00:00:00Z"), Some(1_614_556_800));
        assert_eq!(
            parse_timestamp("2021-03-01T01:00:00+01:00"),
            Some(1_614_556_800)
        );
        assert_eq!(parse_timestamp("2021-03-01T00:00:00"), Some(1_614_556_800));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_from_pairs() {
        let params = RawQueryParams::from_pairs(vec![
            ("field", "sum(session)"),
            ("field", "count_unique(user)"),
            ("groupBy", "release"),
            ("statsPeriod", "7d"),
            ("interval", "1d"),
            ("cursor", "ignored"),
        ]);
        assert_eq!(params.field, vec!["sum(session)", "count_unique(user)"]);
        assert_eq!(params.group_by, vec!["release"]);
        assert_eq!(params.stats_period.as_deref(), Some("7d"));
        assert_eq!(params.interval.as_deref(), Some("1d"));
    }

    #[test]
    fn test_deserialize_camel_case() {
        let params: RawQueryParams = serde_json::from_str(
            r#"{"statsPeriod": "1d", "groupBy": ["project"], "field": ["sum(session)"]}"#,
        )
        .unwrap();
        assert_eq!(params.stats_period.as_deref(), Some("1d"));
        assert_eq!(params.group_by, vec!["project"]);
    }

    #[test]
    fn test_search_query() {
        let filters =
            parse_search_query(r#"release:"my app@1.0" !environment:staging project:4"#).unwrap();
        assert_eq!(filters.len(), 3);
        assert_eq!(
            filters[0],
            Filter::include(GroupByDimension::Release, vec![GroupValue::text("my app@1.0")])
        );
        assert_eq!(
            filters[1],
            Filter::exclude(GroupByDimension::Environment, vec![GroupValue::text("staging")])
        );
        assert_eq!(
            filters[2],
            Filter::include(GroupByDimension::Project, vec![GroupValue::Project(4)])
        );
    }

    #[test]
    fn test_search_query_errors() {
        assert!(parse_search_query("").unwrap().is_empty());
        assert!(parse_search_query("   ").unwrap().is_empty());
        for bad in ["release", "os:linux", "project:abc", "release:\"open"] {
            let err = parse_search_query(bad).unwrap_err();
            assert_eq!(err.parameter.as_deref(), Some("query"), "{}", bad);
        }
    }
}
