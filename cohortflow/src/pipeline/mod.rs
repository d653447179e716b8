//! Stage implementations that turn graph nodes into tool invocations.
//!
//! Every stage runs its nodes through [`StageContext::execute`], which keeps
//! the [`RunLedger`] in step with the runner: a node is marked running before
//! its first attempt, and a fatal failure aborts the node's pending
//! dependents before the error is handed back to the caller.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::{Artifact, ArtifactLayout};
use crate::budget::Budget;
use crate::config::PipelineConfig;
use crate::error::TaskError;
use crate::events::{Barrier, TaskEventPayload};
use crate::graph::{NodeKey, RunLedger};
use crate::runtime::{TaskRunner, ToolExecutor};
use crate::task::{TaskClass, TaskKind, ToolInvocation};

/// Gather steps: per-shard recalibrated VCFs or per-shard metrics into one result.
pub mod gather;
/// INDEL and SNP model training and per-shard application.
pub mod recalibration;
/// Resolution of the gather outcome into the final result set.
pub mod select;
/// Per-interval import, genotyping and hard filtering.
pub mod shard;

pub use gather::{GatherAggregator, GatherOutcome};
pub use recalibration::{
    RecalibratedShard, RecalibrationCoordinator, RecalibrationModel, SnpRecalibration,
    VariantClass,
};
pub use select::{CallsetOutputs, OutputSelector};
pub use shard::{FilteredShard, IntervalShard, ShardPipeline};

/// Why a stage did not produce its artifacts.
#[derive(Clone, Debug, Error)]
pub enum StageError {
    /// The node never ran because something upstream failed.
    #[error("{node} blocked by an upstream failure")]
    Blocked {
        node: NodeKey,
        cause: Option<NodeKey>,
    },

    #[error("{node} failed: {error}")]
    Failed { node: NodeKey, error: TaskError },
}

impl StageError {
    pub fn node(&self) -> NodeKey {
        match self {
            StageError::Blocked { node, .. } | StageError::Failed { node, .. } => *node,
        }
    }
}

/// Shared state every stage of one run works against.
pub struct StageContext<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    runner: Arc<TaskRunner<E, B>>,
    ledger: RunLedger,
    layout: ArtifactLayout,
    config: Arc<PipelineConfig>,
}

impl<E, B> fmt::Debug for StageContext<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.runner.run_id())
            .field("layout", &self.layout)
            .field("ledger", &self.ledger)
            .field("executor_type", &type_name::<E>())
            .finish()
    }
}

impl<E, B> StageContext<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    pub fn new(
        runner: Arc<TaskRunner<E, B>>,
        ledger: RunLedger,
        layout: ArtifactLayout,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            runner,
            ledger,
            layout,
            config,
        }
    }

    pub fn runner(&self) -> &TaskRunner<E, B> {
        &self.runner
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A GATK invocation of `tool`.
    pub fn gatk(&self, kind: TaskKind, tool: &str) -> ToolInvocation {
        ToolInvocation::new(kind, self.config.tools.gatk.clone()).arg(tool)
    }

    /// The error a stage returns for `node` when its inputs never materialized.
    pub fn blocked(&self, node: NodeKey) -> StageError {
        StageError::Blocked {
            node,
            cause: self.ledger.aborted_by(node),
        }
    }

    /// Run `invocation` as graph node `node`.
    pub async fn execute(
        &self,
        node: NodeKey,
        invocation: ToolInvocation,
    ) -> Result<Vec<Artifact>, StageError> {
        if !self.ledger.mark_running(node) {
            return Err(self.blocked(node));
        }

        match self.runner.run(&invocation).await {
            Ok(outputs) => {
                self.ledger.mark_succeeded(node);
                Ok(outputs)
            }
            Err(error) => {
                let aborted = self.ledger.mark_failed(node, error.clone());
                warn!(
                    node = %node,
                    error = %error,
                    aborted = aborted.len(),
                    "task failed; aborting dependents"
                );
                for dependent in aborted {
                    self.runner
                        .publish(TaskEventPayload::Aborted {
                            node: dependent,
                            cause: node,
                        })
                        .await;
                }
                Err(StageError::Failed { node, error })
            }
        }
    }

    /// Announce that every input of `barrier` is available.
    pub async fn reach_barrier(&self, barrier: Barrier, inputs: usize) {
        info!(barrier = barrier.as_str(), inputs, "barrier reached");
        self.runner
            .publish(TaskEventPayload::BarrierReached { barrier, inputs })
            .await;
    }
}

/// Several command lines run as one task through `sh -c`, stopping at the first failure.
pub(crate) fn shell_chain(kind: TaskKind, steps: &[Vec<String>]) -> ToolInvocation {
    let script = steps
        .iter()
        .map(|step| {
            step.iter()
                .map(|word| shell_quote(word))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" && ");
    ToolInvocation::new(kind, "sh").arg("-c").arg(script)
}

fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// Path argument for an artifact's primary file.
pub(crate) fn path_arg(artifact: &Artifact) -> String {
    artifact.primary.display().to_string()
}
