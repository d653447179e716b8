use serde::Serialize;
use tracing::{Instrument, info};

use crate::artifact::{Artifact, MetricsPair};
use crate::budget::Budget;
use crate::events::Barrier;
use crate::graph::NodeKey;
use crate::router::GatherBranch;
use crate::runtime::ToolExecutor;
use crate::task::{ShardIndex, TaskClass, TaskKind, ToolInvocation};
use crate::telemetry::barrier_span;

use super::recalibration::{RecalibratedShard, RecalibrationCoordinator};
use super::shard::{FilteredShard, gather_vcfs_invocation};
use super::{StageContext, StageError, path_arg};

/// What the executed gather branch produced. Exactly one variant exists per run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "branch", rename_all = "snake_case")]
pub enum GatherOutcome {
    /// One merged VCF, measured once.
    Small {
        merged: Artifact,
        #[serde(skip_serializing_if = "Option::is_none")]
        selected: Option<Artifact>,
        metrics: MetricsPair,
    },
    /// Per-shard VCFs left in place; metrics measured per shard then accumulated.
    NonSmall {
        shards: Vec<RecalibratedShard>,
        metrics: MetricsPair,
    },
}

impl GatherOutcome {
    pub fn branch(&self) -> GatherBranch {
        match self {
            GatherOutcome::Small { .. } => GatherBranch::Small,
            GatherOutcome::NonSmall { .. } => GatherBranch::NonSmall,
        }
    }

    pub fn metrics(&self) -> &MetricsPair {
        match self {
            GatherOutcome::Small { metrics, .. } | GatherOutcome::NonSmall { metrics, .. } => {
                metrics
            }
        }
    }
}

pub struct GatherAggregator<'a, E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    ctx: &'a StageContext<E, B>,
    branch: GatherBranch,
}

impl<'a, E, B> GatherAggregator<'a, E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    pub fn new(ctx: &'a StageContext<E, B>, branch: GatherBranch) -> Self {
        Self { ctx, branch }
    }

    pub fn branch(&self) -> GatherBranch {
        self.branch
    }

    /// Recalibrate the shards and run the routed branch over the results.
    ///
    /// On the non-small branch each shard is measured as soon as its own
    /// recalibration lands; the accumulate step is the only fan-in.
    pub async fn run(
        &self,
        recalibration: &RecalibrationCoordinator<'_, E, B>,
        sites_only: &Artifact,
        shards: &[FilteredShard],
    ) -> Result<GatherOutcome, StageError> {
        match self.branch {
            GatherBranch::Small => {
                let recalibrated = recalibration.run(sites_only, shards).await;
                self.gather_small(recalibrated).await
            }
            GatherBranch::NonSmall => {
                let measured = recalibration
                    .run_then(sites_only, shards, |shard| self.measure(shard))
                    .await;
                self.accumulate(measured).await
            }
        }
    }

    /// Merge, then optionally subset, then measure once.
    async fn gather_small(
        &self,
        shards: Vec<Result<RecalibratedShard, StageError>>,
    ) -> Result<GatherOutcome, StageError> {
        let node = NodeKey::FinalGather;
        let inputs: Vec<Artifact> = shards
            .into_iter()
            .map(|shard| shard.map(|shard| shard.vcf))
            .collect::<Result<_, _>>()
            .map_err(|_| self.ctx.blocked(node))?;

        self.ctx.reach_barrier(Barrier::FinalGather, inputs.len()).await;
        let merged = self.ctx.layout().merged();
        let invocation = gather_vcfs_invocation(
            TaskKind::FinalGatherVcf,
            &self.ctx.config().tools.gatk,
            &inputs,
            &merged,
        );
        self.ctx
            .execute(node, invocation)
            .instrument(barrier_span(Barrier::FinalGather.as_str(), inputs.len()))
            .await?;
        info!(vcf = %merged, "merged callset written");

        let metrics = self.ctx.layout().full_metrics();
        let collect = self.ctx.execute(
            NodeKey::MetricsFull,
            self.collect_metrics_invocation(TaskKind::CollectMetricsOnFullVcf, None, &merged, &metrics),
        );
        let selected = async {
            match &self.ctx.config().cohort.select_samples_expression {
                Some(expression) => {
                    let output = self.ctx.layout().selected();
                    let invocation = self
                        .ctx
                        .gatk(TaskKind::SelectSamples, "SelectVariants")
                        .opt("-V", path_arg(&merged))
                        .opt("-O", path_arg(&output))
                        .opt("--sample-expressions", expression)
                        .input(merged.clone())
                        .output(output.clone());
                    self.ctx
                        .execute(NodeKey::SelectSamples, invocation)
                        .await
                        .map(|_| Some(output))
                }
                None => Ok(None),
            }
        };

        let (collected, selected) = futures::join!(collect, selected);
        collected?;
        let selected = selected?;

        Ok(GatherOutcome::Small {
            merged,
            selected,
            metrics,
        })
    }

    /// Collect metrics for one recalibrated shard.
    pub async fn measure(
        &self,
        shard: RecalibratedShard,
    ) -> Result<(RecalibratedShard, MetricsPair), StageError> {
        let metrics = self.ctx.layout().shard_metrics(shard.index);
        self.ctx
            .execute(
                NodeKey::MetricsShard(shard.index),
                self.collect_metrics_invocation(
                    TaskKind::CollectMetricsSharded,
                    Some(shard.index),
                    &shard.vcf,
                    &metrics,
                ),
            )
            .await?;
        Ok((shard, metrics))
    }

    /// Accumulate per-shard metrics. VCFs are never merged on this branch.
    pub async fn accumulate(
        &self,
        measured: Vec<Result<(RecalibratedShard, MetricsPair), StageError>>,
    ) -> Result<GatherOutcome, StageError> {
        let node = NodeKey::MetricsGather;
        let (shards, shard_metrics): (Vec<_>, Vec<_>) = measured
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| self.ctx.blocked(node))?
            .into_iter()
            .unzip();

        self.ctx
            .reach_barrier(Barrier::FinalGather, shard_metrics.len())
            .await;
        let metrics = self.ctx.layout().gathered_metrics();
        self.ctx
            .execute(node, self.accumulate_metrics_invocation(&shard_metrics, &metrics))
            .instrument(barrier_span(Barrier::FinalGather.as_str(), shard_metrics.len()))
            .await?;
        info!(shards = shards.len(), "per-shard metrics accumulated");

        Ok(GatherOutcome::NonSmall { shards, metrics })
    }

    fn collect_metrics_invocation(
        &self,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        vcf: &Artifact,
        metrics: &MetricsPair,
    ) -> ToolInvocation {
        let reference = &self.ctx.config().reference;
        let dbsnp = Artifact::vcf(&reference.dbsnp_vcf);
        let eval = Artifact::plain(&reference.eval_interval_list);

        let invocation = self
            .ctx
            .gatk(kind, "CollectVariantCallingMetrics")
            .opt("--INPUT", path_arg(vcf))
            .opt("--DBSNP", path_arg(&dbsnp))
            .opt("--REFERENCE_SEQUENCE", reference.fasta.display())
            .opt("--OUTPUT", metrics.prefix.display())
            .opt("--THREAD_COUNT", 8)
            .opt("--TARGET_INTERVALS", path_arg(&eval))
            .input(vcf.clone())
            .input(dbsnp)
            .input(eval)
            .output(metrics.detail.clone())
            .output(metrics.summary.clone());
        match shard {
            Some(shard) => invocation.for_shard(shard),
            None => invocation,
        }
    }

    fn accumulate_metrics_invocation(
        &self,
        shard_metrics: &[MetricsPair],
        output: &MetricsPair,
    ) -> ToolInvocation {
        let mut invocation = self
            .ctx
            .gatk(TaskKind::GatherMetrics, "AccumulateVariantCallingMetrics");
        for metrics in shard_metrics {
            invocation = invocation
                .opt("--INPUT", metrics.prefix.display())
                .input(metrics.detail.clone())
                .input(metrics.summary.clone());
        }
        invocation
            .opt("--OUTPUT", output.prefix.display())
            .output(output.detail.clone())
            .output(output.summary.clone())
    }
}
