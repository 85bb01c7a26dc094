//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `astrolabe_reconciliations_total{kind}` - Reconciliations started
//! - `astrolabe_reconciliation_errors_total{kind}` - Reconciliations that returned an error
//! - `astrolabe_reconciliation_duration_seconds{kind}` - Duration of reconciliations
//! - `astrolabe_requeues_total{reason}` - Requeues scheduled, by reason
//! - `astrolabe_status_conflicts_total` - Status writes retried after a version conflict
//! - `astrolabe_module_fetch_total` / `astrolabe_module_fetch_errors_total` - Module source fetches
//! - `astrolabe_module_fetch_duration_seconds` - Duration of module source fetches
//! - `astrolabe_step_runs_total{step}` / `astrolabe_step_failures_total{step}` - Terraform steps
//! - `astrolabe_step_duration_seconds{step}` - Duration of terraform steps

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("astrolabe_reconciliations_total", "Total number of reconciliations"),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "astrolabe_reconciliation_errors_total",
            "Total number of reconciliation errors",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "astrolabe_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 1800.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("astrolabe_requeues_total", "Total number of requeues by reason"),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static STATUS_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "astrolabe_status_conflicts_total",
        "Total number of status writes retried after a resource version conflict",
    )
    .expect("Failed to create STATUS_CONFLICTS_TOTAL metric - this should never happen")
});

static MODULE_FETCH_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("astrolabe_module_fetch_total", "Total number of module source fetches")
        .expect("Failed to create MODULE_FETCH_TOTAL metric - this should never happen")
});

static MODULE_FETCH_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "astrolabe_module_fetch_errors_total",
        "Total number of failed module source fetches",
    )
    .expect("Failed to create MODULE_FETCH_ERRORS_TOTAL metric - this should never happen")
});

static MODULE_FETCH_DURATION: LazyLock<prometheus::Histogram> = LazyLock::new(|| {
    prometheus::Histogram::with_opts(
        HistogramOpts::new(
            "astrolabe_module_fetch_duration_seconds",
            "Duration of module source fetches in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create MODULE_FETCH_DURATION metric - this should never happen")
});

static STEP_RUNS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("astrolabe_step_runs_total", "Total number of terraform step runs"),
        &["step"],
    )
    .expect("Failed to create STEP_RUNS_TOTAL metric - this should never happen")
});

static STEP_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "astrolabe_step_failures_total",
            "Total number of failed terraform step runs",
        ),
        &["step"],
    )
    .expect("Failed to create STEP_FAILURES_TOTAL metric - this should never happen")
});

static STEP_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "astrolabe_step_duration_seconds",
            "Duration of terraform steps in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
        &["step"],
    )
    .expect("Failed to create STEP_DURATION metric - this should never happen")
});

/// Register all metrics with the registry exposed on `/metrics`
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_CONFLICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MODULE_FETCH_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MODULE_FETCH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MODULE_FETCH_DURATION.clone()))?;
    REGISTRY.register(Box::new(STEP_RUNS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STEP_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STEP_DURATION.clone()))?;
    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(kind: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_status_conflicts() {
    STATUS_CONFLICTS_TOTAL.inc();
}

pub fn increment_module_fetch_total() {
    MODULE_FETCH_TOTAL.inc();
}

pub fn increment_module_fetch_errors_total() {
    MODULE_FETCH_ERRORS_TOTAL.inc();
}

pub fn observe_module_fetch_duration(duration: f64) {
    MODULE_FETCH_DURATION.observe(duration);
}

pub fn increment_step_runs(step: &str) {
    STEP_RUNS_TOTAL.with_label_values(&[step]).inc();
}

pub fn increment_step_failures(step: &str) {
    STEP_FAILURES_TOTAL.with_label_values(&[step]).inc();
}

pub fn observe_step_duration(step: &str, duration: f64) {
    STEP_DURATION.with_label_values(&[step]).observe(duration);
}
