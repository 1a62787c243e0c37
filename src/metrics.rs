// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the CSI driver operator.
//!
//! All metrics carry the namespace prefix `csi_operator`.
//!
//! # Metrics Categories
//!
//! - **Pass Metrics** - Reconciliation passes, their outcome and duration
//! - **Component Metrics** - Per-driver outcome of each pass
//! - **Object Metrics** - Cluster objects created, updated, left unchanged or deleted
//! - **Error Metrics** - Pass-aborting errors by category
//!
//! # Example
//!
//! ```rust,no_run
//! use csi_operator::metrics::record_pass_success;
//!
//! record_pass_success(std::time::Duration::from_secs(1));
//! ```

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;
use std::time::Duration;

/// Namespace prefix for all operator metrics
const METRICS_NAMESPACE: &str = "csi_operator";

/// Global Prometheus metrics registry, exposed via the `/metrics` endpoint.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Pass Metrics
// ============================================================================

/// Total number of reconciliation passes
///
/// Labels:
/// - `status`: Outcome (`success`, `degraded`, `error`)
pub static PASSES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_passes_total"),
        "Total number of reconciliation passes by status",
    );
    let counter = CounterVec::new(opts, &["status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliation passes in seconds
///
/// The version probe runs inside the pass, so the upper buckets reach its ceiling.
pub static PASS_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_pass_duration_seconds"),
        "Duration of reconciliation passes in seconds by status",
    )
    .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]);
    let histogram = HistogramVec::new(opts, &["status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

// ============================================================================
// Component Metrics
// ============================================================================

/// Per-driver outcome of each pass
///
/// Labels:
/// - `driver`: `rbd`, `cephfs` or `nfs`
/// - `outcome`: `applied`, `removed` or `failed`
pub static COMPONENT_OUTCOMES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_component_outcomes_total"),
        "Per-driver outcome of reconciliation passes",
    );
    let counter = CounterVec::new(opts, &["driver", "outcome"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Object Metrics
// ============================================================================

/// Cluster object operations
///
/// Labels:
/// - `kind`: Object kind (e.g., `DaemonSet`, `CSIDriver`)
/// - `operation`: `created`, `updated`, `unchanged` or `deleted`
pub static OBJECT_OPERATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_object_operations_total"),
        "Total number of cluster object operations by kind and operation",
    );
    let counter = CounterVec::new(opts, &["kind", "operation"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Error Metrics
// ============================================================================

/// Pass-aborting errors
///
/// Labels:
/// - `error_type`: `setup_error`, `validation_error`, `probe_error` or `timeout`
pub static ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_errors_total"),
        "Total number of pass-aborting errors by category",
    );
    let counter = CounterVec::new(opts, &["error_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Helper Functions
// ============================================================================

fn record_pass(status: &str, duration: Duration) {
    PASSES_TOTAL.with_label_values(&[status]).inc();
    PASS_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration.as_secs_f64());
}

/// Record a pass in which every driver converged
pub fn record_pass_success(duration: Duration) {
    record_pass("success", duration);
}

/// Record a pass that finished with at least one failed driver
pub fn record_pass_degraded(duration: Duration) {
    record_pass("degraded", duration);
}

/// Record a pass aborted before or during the version probe
///
/// # Arguments
/// * `error_type` - Category of the error (see [`ERRORS_TOTAL`])
/// * `duration` - Duration of the pass before it aborted
pub fn record_pass_error(error_type: &str, duration: Duration) {
    record_pass("error", duration);
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Record the outcome of one driver
pub fn record_component_outcome(driver: &str, outcome: &str) {
    COMPONENT_OUTCOMES_TOTAL
        .with_label_values(&[driver, outcome])
        .inc();
}

/// Record a create, update, no-op or delete of a cluster object
pub fn record_object_operation(kind: &str, operation: &str) {
    OBJECT_OPERATIONS_TOTAL
        .with_label_values(&[kind, operation])
        .inc();
}

/// Gather and encode all metrics in Prometheus text format
///
/// # Errors
/// Returns error if encoding fails
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}
