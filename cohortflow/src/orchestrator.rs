//! End-to-end driver for one joint-calling run.
//!
//! ```text
//! intervals ─► plan chains ─► ShardPipeline × N ─► sites-only gather
//!                                                     │
//!                 route(num_samples) ─────────────────┤
//!                                                     ▼
//!                                  RecalibrationCoordinator (INDEL ∥ SNP)
//!                                                     │
//!                                    GatherAggregator (small | non-small)
//!                                                     │
//!                                               OutputSelector
//! ```

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{Instrument, info, warn};

use crate::artifact::ArtifactLayout;
use crate::budget::Budget;
use crate::config::{CohortSampleMap, PipelineConfig};
use crate::error::OrchestratorError;
use crate::events::TaskEventPayload;
use crate::graph::{RunLedger, RunReport, TaskGraph};
use crate::interval::{
    GenomicInterval, IntervalPlanner, derived_merge_count, read_interval_list, validate_intervals,
};
use crate::pipeline::{
    CallsetOutputs, GatherAggregator, IntervalShard, OutputSelector, RecalibrationCoordinator,
    ShardPipeline, StageContext,
};
use crate::router::{CohortSizeRouter, RouteDecision};
use crate::runtime::{TaskRunner, ToolExecutor};
use crate::task::{RunId, TaskClass};
use crate::telemetry::run_span;

/// Everything decided before the first task runs.
#[derive(Clone, Debug, Serialize)]
pub struct RunPlan {
    pub callset: String,
    pub num_samples: usize,
    pub num_intervals: usize,
    /// Chain length actually used.
    pub merge_count: usize,
    /// Chain length the cohort shape suggests; differs from `merge_count` when pinned.
    pub derived_merge_count: usize,
    pub decision: RouteDecision,
    pub shards: Vec<IntervalShard>,
    pub task_count: usize,
}

/// A complete run: its result set and the final status of every node.
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub plan: RunPlan,
    pub outputs: CallsetOutputs,
    pub report: RunReport,
}

pub struct JointCallingOrchestrator<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    config: Arc<PipelineConfig>,
    runner: Arc<TaskRunner<E, B>>,
    router: CohortSizeRouter,
    check_output_files: bool,
}

impl<E, B> fmt::Debug for JointCallingOrchestrator<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JointCallingOrchestrator")
            .field("callset", &self.config.cohort.callset_name)
            .field("router", &self.router)
            .field("runner", &self.runner)
            .field("executor_type", &type_name::<E>())
            .field("check_output_files", &self.check_output_files)
            .finish()
    }
}

impl<E, B> JointCallingOrchestrator<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    pub fn new(config: PipelineConfig, runner: TaskRunner<E, B>) -> Self {
        let router = CohortSizeRouter::new(config.routing);
        Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
            router,
            check_output_files: false,
        }
    }

    /// Require the selected outputs to exist on disk before reporting success.
    pub fn with_output_check(mut self, enabled: bool) -> Self {
        self.check_output_files = enabled;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runner(&self) -> &TaskRunner<E, B> {
        &self.runner
    }

    /// Load the sample map named in the configuration.
    pub fn load_samples(&self) -> Result<CohortSampleMap, OrchestratorError> {
        Ok(CohortSampleMap::load(&self.config.cohort.sample_map)?)
    }

    /// Load the sample map and interval list named in the configuration.
    pub fn load_inputs(&self) -> Result<(CohortSampleMap, Vec<GenomicInterval>), OrchestratorError> {
        let samples = self.load_samples()?;
        let intervals = read_interval_list(&self.config.cohort.intervals)?;
        Ok((samples, intervals))
    }

    /// Chain the intervals and route the cohort.
    pub fn plan(
        &self,
        samples: &CohortSampleMap,
        intervals: &[GenomicInterval],
    ) -> Result<RunPlan, OrchestratorError> {
        if samples.is_empty() {
            return Err(OrchestratorError::EmptyCohort);
        }
        validate_intervals(intervals)?;

        let num_samples = samples.len();
        let merge_count = self
            .config
            .scatter
            .merge_count
            .resolve(intervals.len(), num_samples);
        let chains = IntervalPlanner::new(merge_count).plan(intervals);
        let shards = IntervalShard::from_chains(chains);
        let decision = self.router.route(num_samples);
        let task_count = TaskGraph::plan(shards.len(), &decision, self.selects_samples()).len();

        Ok(RunPlan {
            callset: self.config.cohort.callset_name.clone(),
            num_samples,
            num_intervals: intervals.len(),
            merge_count,
            derived_merge_count: derived_merge_count(intervals.len(), num_samples),
            decision,
            shards,
            task_count,
        })
    }

    /// Run with the inputs named in the configuration.
    pub async fn run(&self) -> Result<RunOutcome, OrchestratorError> {
        let (samples, intervals) = self.load_inputs()?;
        self.run_with(&samples, &intervals).await
    }

    pub async fn run_with(
        &self,
        samples: &CohortSampleMap,
        intervals: &[GenomicInterval],
    ) -> Result<RunOutcome, OrchestratorError> {
        let plan = self.plan(samples, intervals)?;
        let run_id = self.runner.run_id();
        let span = run_span(run_id.to_string(), &plan.callset, plan.num_samples);
        self.execute(plan).instrument(span).await
    }

    async fn execute(&self, plan: RunPlan) -> Result<RunOutcome, OrchestratorError> {
        let decision = plan.decision;
        let branch = decision.gather;
        let graph = TaskGraph::plan(plan.shards.len(), &decision, self.selects_samples());
        let ledger = RunLedger::new(graph);
        let layout = ArtifactLayout::new(
            &self.config.cohort.output_dir,
            &self.config.cohort.callset_name,
        );
        let ctx = StageContext::new(
            Arc::clone(&self.runner),
            ledger.clone(),
            layout,
            Arc::clone(&self.config),
        );

        info!(
            samples = plan.num_samples,
            shards = plan.shards.len(),
            merge_count = plan.merge_count,
            train_model = decision.train_model,
            branch = %branch,
            tasks = plan.task_count,
            "starting run"
        );
        self.runner
            .publish(TaskEventPayload::BranchSelected { branch })
            .await;

        let shard_pipeline = ShardPipeline::new(&ctx);
        let filtered = shard_pipeline.run_all(&plan.shards).await;
        let outcome = match shard_pipeline.gather_sites_only(&filtered).await {
            Ok(sites_only) => {
                let shards: Vec<_> = filtered.into_iter().filter_map(Result::ok).collect();
                let recalibration = RecalibrationCoordinator::new(&ctx, decision);
                GatherAggregator::new(&ctx, branch)
                    .run(&recalibration, &sites_only, &shards)
                    .await
            }
            Err(err) => Err(err),
        };

        let skipped = ledger.skip_pending();
        if !skipped.is_empty() {
            warn!(skipped = skipped.len(), "nodes left pending at end of run");
        }
        let report = ledger.report();
        let selector = OutputSelector::new(branch, plan.shards.len())
            .with_file_check(self.check_output_files);

        match outcome {
            Ok(outcome) => {
                let outputs = selector.select(Some(outcome))?;
                info!(
                    branch = %branch,
                    succeeded = report.succeeded,
                    "run complete"
                );
                Ok(RunOutcome {
                    run_id: self.runner.run_id(),
                    plan,
                    outputs,
                    report,
                })
            }
            Err(err) => {
                let reason = selector.select(None).err();
                warn!(
                    branch = %branch,
                    stage = %err,
                    failed = report.failed,
                    aborted = report.aborted,
                    selection = ?reason,
                    "run incomplete"
                );
                Err(OrchestratorError::Incomplete {
                    branch,
                    failures: ledger.failures(),
                    report: Box::new(report),
                })
            }
        }
    }

    fn selects_samples(&self) -> bool {
        self.config.cohort.select_samples_expression.is_some()
    }
}
