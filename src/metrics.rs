//! Metrics and telemetry for the sessions query core
//!
//! Prometheus metrics registered in the default registry on first use.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, register_int_counter,
    CounterVec, Encoder, Histogram, HistogramVec, IntCounter, TextEncoder,
};

lazy_static! {
    // === Query Counters ===

    /// Sessions queries by outcome
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "release_health_queries_total",
        "Total sessions queries by outcome",
        &["outcome"]
    ).unwrap();

    /// Series rows that did not land on the bucket grid
    pub static ref SERIES_ROWS_DROPPED: IntCounter = register_int_counter!(
        "release_health_series_rows_dropped_total",
        "Series rows dropped because their bucket was outside the grid"
    ).unwrap();

    // === Latency Histograms ===

    /// End-to-end query duration
    pub static ref QUERY_DURATION: Histogram = register_histogram!(
        "release_health_query_duration_seconds",
        "Sessions query latency in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    /// Store query duration by kind (totals/series)
    pub static ref STORE_QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "release_health_store_query_duration_seconds",
        "Store query latency in seconds",
        &["kind"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // === Result Shape ===

    /// Groups per response
    pub static ref GROUPS_RETURNED: Histogram = register_histogram!(
        "release_health_groups_returned",
        "Number of groups in a sessions response",
        vec![0.0, 1.0, 10.0, 100.0, 1000.0, 10000.0]
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_text() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a finished sessions query
#[inline]
pub fn record_query(outcome: &str, duration_secs: f64) {
    QUERIES_TOTAL.with_label_values(&[outcome]).inc();
    QUERY_DURATION.observe(duration_secs);
}
