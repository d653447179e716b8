//! Prometheus collectors for cohortflow runs.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `cohortflow_tasks_completed_total` - Tasks that reached a terminal state
//! - `cohortflow_task_retries_total` - Retries, split by reason (transient, preempted)
//!
//! ## Gauges
//! - `cohortflow_inflight_tasks` - Tasks currently holding a compute slot
//!
//! ## Histograms
//! - `cohortflow_task_duration_seconds` - Wall time of a task across all of its attempts
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `task_kind`, `status` (`succeeded`, `failed`, `cancelled`).
pub static TASKS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "cohortflow_tasks_completed_total",
        "Total number of tasks that reached a terminal state",
    );
    CounterVec::new(opts, &["task_kind", "status"])
        .expect("cohortflow_tasks_completed_total metric creation failed")
});

/// Labels: `task_kind`, `reason`.
pub static TASK_RETRIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "cohortflow_task_retries_total",
        "Total number of task attempts that were retried",
    );
    CounterVec::new(opts, &["task_kind", "reason"])
        .expect("cohortflow_task_retries_total metric creation failed")
});

/// Labels: `task_class`.
pub static INFLIGHT_TASKS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "cohortflow_inflight_tasks",
        "Tasks currently holding a compute slot",
    );
    GaugeVec::new(opts, &["task_class"]).expect("cohortflow_inflight_tasks metric creation failed")
});

/// Labels: `task_kind`, `status`.
pub static TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 20).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "cohortflow_task_duration_seconds",
        "Task wall time in seconds across all attempts",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["task_kind", "status"])
        .expect("cohortflow_task_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_COMPLETED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASK_RETRIES_TOTAL.clone()),
        Box::new(INFLIGHT_TASKS.clone()),
        Box::new(TASK_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_task_completed(task_kind: &str, status: &str) {
    TASKS_COMPLETED_TOTAL
        .with_label_values(&[task_kind, status])
        .inc();
}

pub fn record_task_retry(task_kind: &str, reason: &str) {
    TASK_RETRIES_TOTAL
        .with_label_values(&[task_kind, reason])
        .inc();
}

pub fn set_inflight_tasks(task_class: &str, inflight: f64) {
    INFLIGHT_TASKS.with_label_values(&[task_class]).set(inflight);
}

pub fn observe_task_duration(task_kind: &str, status: &str, duration_secs: f64) {
    TASK_DURATION_SECONDS
        .with_label_values(&[task_kind, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
