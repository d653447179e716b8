//! Tracing spans and lifecycle recording for task execution.
//!
//! Every helper logs through `tracing` and, with the `metrics` feature,
//! also updates the collectors in [`crate::metrics`]. Without the feature
//! the metric side is compiled out.
//!
//! # Example
//!
//! ```ignore
//! use cohortflow::telemetry::{instrument_task, record_task_start, record_task_end};
//!
//! let timing = record_task_start(invocation.label());
//! let result = instrument_task(invocation.id.to_string(), invocation.kind.as_str(), run(invocation)).await;
//! record_task_end(timing, invocation.kind.as_str(), "succeeded");
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Span around a single tool invocation, covering all of its attempts.
#[must_use]
pub fn task_span(task_id: impl AsRef<str>, task_kind: impl AsRef<str>) -> Span {
    info_span!(
        "cohortflow.task",
        task_id = %task_id.as_ref(),
        task_kind = %task_kind.as_ref(),
    )
}

/// Span around the per-shard pipeline (import, genotype, filter).
#[must_use]
pub fn shard_span(shard: usize, interval: impl AsRef<str>) -> Span {
    info_span!(
        "cohortflow.shard",
        shard = shard,
        interval = %interval.as_ref(),
    )
}

/// Span around a fan-in point that waits for all shards.
#[must_use]
pub fn barrier_span(barrier: impl AsRef<str>, inputs: usize) -> Span {
    info_span!(
        "cohortflow.barrier",
        barrier = %barrier.as_ref(),
        inputs = inputs,
    )
}

/// Span around the whole run.
#[must_use]
pub fn run_span(run_id: impl AsRef<str>, callset: impl AsRef<str>, num_samples: usize) -> Span {
    info_span!(
        "cohortflow.run",
        run_id = %run_id.as_ref(),
        callset = %callset.as_ref(),
        num_samples = num_samples,
    )
}

/// Attach a [`task_span`] to a future.
pub fn instrument_task<F>(
    task_id: impl AsRef<str>,
    task_kind: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = task_span(task_id, task_kind);
    future.instrument(span)
}

/// Record a task reaching a terminal state.
///
/// `status` is one of `succeeded`, `failed`, `cancelled`.
pub fn record_task_completed(task: impl AsRef<str>, task_kind: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        task = %task.as_ref(),
        task_kind = %task_kind.as_ref(),
        status = %status.as_ref(),
        "task finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_completed(task_kind.as_ref(), status.as_ref());
}

/// Record an attempt that will be retried.
pub fn record_task_retry(
    task: impl AsRef<str>,
    task_kind: impl AsRef<str>,
    reason: impl AsRef<str>,
    attempt: u32,
) {
    tracing::warn!(
        task = %task.as_ref(),
        task_kind = %task_kind.as_ref(),
        reason = %reason.as_ref(),
        attempt = attempt,
        "task attempt failed, retrying"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_retry(task_kind.as_ref(), reason.as_ref());
}

/// Update the in-flight gauge for a task class.
pub fn set_inflight_tasks(task_class: impl AsRef<str>, inflight: usize) {
    tracing::debug!(
        task_class = %task_class.as_ref(),
        inflight = inflight,
        "in-flight tasks updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_inflight_tasks(task_class.as_ref(), inflight as f64);
}

pub fn observe_task_duration(task_kind: impl AsRef<str>, status: impl AsRef<str>, duration_secs: f64) {
    tracing::debug!(
        task_kind = %task_kind.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration_secs,
        "task duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_task_duration(task_kind.as_ref(), status.as_ref(), duration_secs);
}

/// Start timing a task. Pass the handle to [`record_task_end`].
pub fn record_task_start(task: impl AsRef<str>) -> TaskTimingHandle {
    TaskTimingHandle {
        task: task.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

pub fn record_task_end(handle: TaskTimingHandle, task_kind: impl AsRef<str>, status: impl AsRef<str>) {
    observe_task_duration(task_kind, status, handle.start.elapsed().as_secs_f64());
}

/// Opaque timing handle returned by [`record_task_start`].
#[derive(Debug)]
pub struct TaskTimingHandle {
    task: String,
    start: std::time::Instant,
}

impl TaskTimingHandle {
    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
