//! Cohortflow - cohort-scale-adaptive scatter/gather orchestration for joint
//! variant calling.
//!
//! The genotyping, recalibration and metrics tools are external programs
//! with a file-in/file-out contract. This crate decides what to run, in which
//! shape, and how to turn the per-shard results into one consistent output.
//!
//! # Core Concepts
//!
//! - **Intervals**: [`IntervalPlanner`] merges sorted, disjoint genomic
//!   intervals into [`IntervalChain`]s of adjacent members. Each chain is one
//!   shard of the import/genotype/filter stage.
//!
//! - **Routing**: [`CohortSizeRouter`] maps the cohort size to a
//!   [`RouteDecision`]: whether the SNP model is trained once on a
//!   downsampled subset and reused per shard, and which gather branch runs.
//!
//! - **Task graph**: [`TaskGraph`] is the explicit DAG of one run, planned up
//!   front from the shard count and the route. [`RunLedger`] tracks per-node
//!   status and aborts only the dependents of a failed node.
//!
//! - **Runtime**: [`TaskRunner`] executes one [`ToolInvocation`] under the
//!   compute [`Budget`] with separate transient and preemption retry budgets.
//!   A task never succeeds without every declared output.
//!
//! - **Pipeline**: the stages in [`pipeline`] map graph nodes to tool
//!   invocations; [`JointCallingOrchestrator`] drives them end to end and
//!   resolves the single [`GatherOutcome`] into [`CallsetOutputs`].
//!
//! - **Events**: [`InProcEventBus`] broadcasts [`TaskEvent`]s for every
//!   attempt, retry, failure, abort and barrier.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus collectors for task completions, retries,
//!   durations and in-flight tasks
//!
//! # Example
//!
//! ```ignore
//! use cohortflow::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::load("run.toml".as_ref())?;
//! config.validate()?;
//! let runner = TaskRunnerBuilder::<CommandToolExecutor, InMemoryBudget<TaskClass>>::new(
//!     config.runner_config(),
//! )
//! .with_executor(Arc::new(CommandToolExecutor::new()))
//! .with_in_memory_budget()
//! .with_events(Arc::new(InProcEventBus::default()))
//! .build()?;
//! let outcome = JointCallingOrchestrator::new(config, runner).run().await?;
//! ```

/// File artifacts and the per-run naming scheme.
pub mod artifact;

/// Compute-slot budgeting per task class.
///
/// The `budget` module provides the [`Budget`] trait and the
/// [`InMemoryBudget`] implementation that tracks per-class counts in memory.
pub mod budget;

/// TOML run configuration and the cohort sample map.
pub mod config;

/// Error types for intervals, configuration, tasks, selection and runs.
pub mod error;

/// Task lifecycle events and the in-process event bus.
pub mod events;

/// Explicit task graph with typed edges, and the run status ledger.
pub mod graph;

/// Genomic intervals, interval-list loading and chain planning.
pub mod interval;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
///
/// The `metrics` module registers task collectors when the `metrics`
/// feature is enabled.
pub mod metrics;

/// End-to-end run driver.
pub mod orchestrator;

/// Stage implementations: shard pipeline, recalibration, gather, selection.
pub mod pipeline;

/// Transient and preemption retry accounting.
pub mod retry;

/// Cohort-size routing.
pub mod router;

/// Task execution.
///
/// The `runtime` module provides:
/// - [`TaskRunner`] - runs one invocation to a terminal state
/// - [`TaskRunnerBuilder`] - builder with explicit dependencies
/// - [`ToolExecutor`] - trait for running one attempt
/// - [`CommandToolExecutor`] - child-process executor
/// - [`ResourceProfile`] and [`RunnerConfig`] - per-class sizing and runner settings
/// - [`ShutdownToken`] - cancellation signalling
pub mod runtime;

/// Tool invocations, task kinds and identifiers.
pub mod task;

/// Tracing spans and instrumentation helpers.
pub mod telemetry;

pub use artifact::*;
pub use budget::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use graph::*;
pub use interval::*;
pub use orchestrator::*;
pub use pipeline::{
    CallsetOutputs, FilteredShard, GatherAggregator, GatherOutcome, IntervalShard,
    OutputSelector, RecalibratedShard, RecalibrationCoordinator, RecalibrationModel,
    ShardPipeline, SnpRecalibration, StageContext, StageError, VariantClass,
};
pub use retry::*;
pub use router::*;
pub use runtime::*;
pub use task::*;
