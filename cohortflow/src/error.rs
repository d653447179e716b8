//! Error taxonomy.
//!
//! `TaskError` is what a single tool invocation can end with once its retry
//! budgets are spent. Everything above the task level (branches, selection,
//! the whole run) reports through `OrchestratorError`.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::graph::{NodeKey, RunReport};
use crate::router::GatherBranch;

#[derive(Debug, Error)]
pub enum IntervalError {
    #[error("line {line}: cannot parse interval `{content}`: {reason}")]
    Parse {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("interval {chromosome}:{start}-{end} has start after end")]
    Inverted {
        chromosome: String,
        start: u64,
        end: u64,
    },

    #[error("interval list is not sorted or overlaps: {previous} then {next}")]
    Unsorted { previous: String, next: String },

    #[error("interval list is empty")]
    Empty,

    #[error("failed to read interval list {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required {what}: {}", path.display())]
    MissingFile { what: String, path: PathBuf },

    #[error("sample map line {line}: {reason}")]
    SampleMap { line: usize, reason: String },

    #[error("sample `{0}` appears more than once in the sample map")]
    DuplicateSample(String),
}

/// Terminal failure of one task after local retries.
#[derive(Clone, Debug, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskError {
    #[error("{task}: transient failure persisted through {attempts} attempts: {last_error}")]
    TransientBudgetExhausted {
        task: String,
        attempts: u16,
        last_error: String,
    },

    #[error("{task}: preempted {preemptions} times (max_retries = {max_retries})")]
    PreemptionBudgetExhausted {
        task: String,
        preemptions: u16,
        max_retries: u16,
    },

    #[error("{task}: {message}")]
    Permanent { task: String, message: String },

    #[error("{task}: reported success without declared outputs {missing:?}")]
    MissingOutputs { task: String, missing: Vec<PathBuf> },

    #[error("{task}: cancelled before completion")]
    Cancelled { task: String },

    #[error("{task}: compute budget error: {message}")]
    Budget { task: String, message: String },
}

impl TaskError {
    pub fn task(&self) -> &str {
        match self {
            TaskError::TransientBudgetExhausted { task, .. }
            | TaskError::PreemptionBudgetExhausted { task, .. }
            | TaskError::Permanent { task, .. }
            | TaskError::MissingOutputs { task, .. }
            | TaskError::Cancelled { task }
            | TaskError::Budget { task, .. } => task,
        }
    }

    /// Whether resubmitting the same task in a fresh run could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::TransientBudgetExhausted { .. }
                | TaskError::PreemptionBudgetExhausted { .. }
                | TaskError::Cancelled { .. }
        )
    }
}

/// A failed graph node together with what it failed with.
#[derive(Clone, Debug, Serialize)]
pub struct TaskFailure {
    pub node: NodeKey,
    pub error: TaskError,
}

#[derive(Clone, Debug, Error)]
pub enum SelectionError {
    #[error("routed to the {expected} branch but the {found} branch produced outputs")]
    BranchMismatch {
        expected: GatherBranch,
        found: GatherBranch,
    },

    #[error("{branch} branch is not ready: {reason}")]
    NotReady {
        branch: GatherBranch,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Interval(#[from] IntervalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("cohort has no samples")]
    EmptyCohort,

    #[error(
        "run incomplete: {branch} branch outputs did not materialize ({} failed task(s))",
        failures.len()
    )]
    Incomplete {
        branch: GatherBranch,
        failures: Vec<TaskFailure>,
        report: Box<RunReport>,
    },
}
