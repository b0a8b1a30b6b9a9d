//! Metrics and telemetry for the aggregation core
//!
//! Prometheus metrics for merge throughput, split fan-out, regroup activity,
//! memory reservation usage and teardown failures.
//!
//! Recording goes through the `record_*` helpers, which do nothing while
//! metrics are disabled with [`set_enabled`].

use std::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, register_int_counter_vec,
    CounterVec, Encoder, Gauge, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // === Throughput Counters ===

    /// Terms emitted by merge iterators
    pub static ref TERMS_MERGED: IntCounter = register_int_counter!(
        "ftgs_terms_merged_total",
        "Total terms emitted by k-way merges"
    ).unwrap();

    /// Terms routed by the splitter, by outcome
    pub static ref SPLIT_TERMS: IntCounterVec = register_int_counter_vec!(
        "ftgs_split_terms_total",
        "Total terms routed to split outputs",
        &["status"]
    ).unwrap();

    /// Regroup operations by kind
    pub static ref REGROUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ftgs_regroups_total",
        "Total regroup operations by kind",
        &["kind"]
    ).unwrap();

    /// Shared aggregation rounds by outcome
    pub static ref AGGREGATION_ROUNDS: IntCounterVec = register_int_counter_vec!(
        "ftgs_aggregation_rounds_total",
        "Barrier-synchronised aggregation rounds",
        &["status"]
    ).unwrap();

    // === Resource Gauges ===

    /// Bytes currently claimed from memory reservations
    pub static ref MEMORY_CLAIMED_BYTES: Gauge = register_gauge!(
        "ftgs_memory_claimed_bytes",
        "Bytes currently claimed from shared memory reservations"
    ).unwrap();

    // === Error Counters ===

    /// Resource close failures during best-effort teardown
    pub static ref CLOSE_FAILURES: CounterVec = register_counter_vec!(
        "ftgs_close_failures_total",
        "Failures observed while closing resources",
        &["resource"]
    ).unwrap();

    /// Memory leaks detected at teardown
    pub static ref MEMORY_LEAKS: IntCounter = register_int_counter!(
        "ftgs_memory_leaks_total",
        "Teardowns that found memory still claimed"
    ).unwrap();
}

static METRICS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn metric recording on or off process-wide
pub fn set_enabled(enabled: bool) {
    METRICS_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether metric recording is on
#[inline]
pub fn is_enabled() -> bool {
    METRICS_ENABLED.load(Ordering::Relaxed)
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a term emitted by a merge
#[inline]
pub fn record_term_merged() {
    if is_enabled() {
        TERMS_MERGED.inc();
    }
}

/// Record a regroup operation
#[inline]
pub fn record_regroup(kind: &str) {
    if is_enabled() {
        REGROUPS_TOTAL.with_label_values(&[kind]).inc();
    }
}

/// Record a routed split term
#[inline]
pub fn record_split_term(success: bool) {
    if is_enabled() {
        let status = if success { "success" } else { "error" };
        SPLIT_TERMS.with_label_values(&[status]).inc();
    }
}

/// Record an aggregation round
#[inline]
pub fn record_aggregation_round(success: bool) {
    if is_enabled() {
        let status = if success { "success" } else { "error" };
        AGGREGATION_ROUNDS.with_label_values(&[status]).inc();
    }
}

/// Record a failed close of `resource`
pub fn record_close_failure(resource: &str) {
    if is_enabled() {
        CLOSE_FAILURES.with_label_values(&[resource]).inc();
    }
}

/// Record a teardown that found memory still claimed
pub fn record_memory_leak() {
    if is_enabled() {
        MEMORY_LEAKS.inc();
    }
}

/// Publish current claimed memory
#[inline]
pub fn update_memory_claimed(bytes: u64) {
    if is_enabled() {
        MEMORY_CLAIMED_BYTES.set(bytes as f64);
    }
}
