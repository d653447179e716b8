//! Two-model recalibration.
//!
//! The INDEL model is always trained once on the full gathered sites-only
//! VCF. The SNP strategy depends on the route: small and medium cohorts
//! train and score in one classic run, large cohorts train a reusable model
//! on a downsampled subset, score every shard with it and gather the
//! per-shard tranches. Both trainings start together.
//!
//! Application is two sequential steps per shard, INDEL first. A shard
//! starts its INDEL application as soon as the INDEL model exists and only
//! then waits for the SNP side. Scored outputs are paired with shards by
//! [`ShardIndex`], never by list position.

use std::collections::BTreeMap;
use std::future::Future;

use futures::FutureExt;
use futures::future::{join_all, join3};
use serde::Serialize;
use tracing::{Instrument, debug, info};

use crate::artifact::Artifact;
use crate::budget::Budget;
use crate::config::{ModelSettings, TrainingResource};
use crate::events::Barrier;
use crate::graph::NodeKey;
use crate::router::RouteDecision;
use crate::runtime::ToolExecutor;
use crate::task::{ShardIndex, TaskClass, TaskKind, ToolInvocation};
use crate::telemetry::barrier_span;

use super::shard::FilteredShard;
use super::{StageContext, StageError, path_arg};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantClass {
    Indel,
    Snp,
}

impl VariantClass {
    /// Value of the recalibration tools' `-mode` flag.
    pub fn mode(&self) -> &'static str {
        match self {
            VariantClass::Indel => "INDEL",
            VariantClass::Snp => "SNP",
        }
    }
}

/// A trained filter for one variant class, as applied to a shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecalibrationModel {
    pub class: VariantClass,
    /// Recalibration table and its index.
    pub recal: Artifact,
    pub tranches: Artifact,
    /// Set when the model was trained on a downsampled subset and reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_report: Option<Artifact>,
}

/// Result of whichever SNP strategy the route selected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SnpRecalibration {
    /// One training-and-scoring run over the full sites-only VCF.
    Classic { model: RecalibrationModel },
    /// Reusable model, per-shard recalibration tables and gathered tranches.
    Scattered {
        model_report: Artifact,
        shards: BTreeMap<ShardIndex, Artifact>,
        tranches: Artifact,
    },
}

impl SnpRecalibration {
    /// The model to apply to `shard`, or `None` if no table was scored for it.
    pub fn model_for(&self, shard: ShardIndex) -> Option<RecalibrationModel> {
        match self {
            SnpRecalibration::Classic { model } => Some(model.clone()),
            SnpRecalibration::Scattered {
                model_report,
                shards,
                tranches,
            } => shards.get(&shard).map(|recal| RecalibrationModel {
                class: VariantClass::Snp,
                recal: recal.clone(),
                tranches: tranches.clone(),
                model_report: Some(model_report.clone()),
            }),
        }
    }
}

/// A shard with both filters applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecalibratedShard {
    pub index: ShardIndex,
    pub vcf: Artifact,
}

pub struct RecalibrationCoordinator<'a, E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    ctx: &'a StageContext<E, B>,
    decision: RouteDecision,
}

impl<'a, E, B> RecalibrationCoordinator<'a, E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    pub fn new(ctx: &'a StageContext<E, B>, decision: RouteDecision) -> Self {
        Self { ctx, decision }
    }

    /// Train both models and apply them to every shard.
    ///
    /// Returns one result per input shard, in input order. A shard whose
    /// application could not run reports `Blocked` or `Failed`; other shards
    /// are unaffected.
    pub async fn run(
        &self,
        sites_only: &Artifact,
        shards: &[FilteredShard],
    ) -> Vec<Result<RecalibratedShard, StageError>> {
        self.run_then(sites_only, shards, |shard| async move { Ok(shard) })
            .await
    }

    /// Like [`run`](Self::run), but each shard continues into `then` as soon
    /// as its own SNP application succeeds, without waiting for siblings.
    pub async fn run_then<T, F, Fut>(
        &self,
        sites_only: &Artifact,
        shards: &[FilteredShard],
        then: F,
    ) -> Vec<Result<T, StageError>>
    where
        F: Fn(RecalibratedShard) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let indel = self.train_indel(sites_only).shared();
        let snp = self.train_snp(sites_only, shards).shared();

        let then = &then;
        let applied = join_all(shards.iter().map(|shard| {
            let recalibrated = self.apply_shard(shard, indel.clone(), snp.clone());
            async move { then(recalibrated.await?).await }
        }));
        let (_, _, results) = join3(indel, snp, applied).await;
        results
    }

    pub async fn train_indel(&self, sites_only: &Artifact) -> Result<RecalibrationModel, StageError> {
        let layout = self.ctx.layout();
        let model = RecalibrationModel {
            class: VariantClass::Indel,
            recal: layout.indel_recal(),
            tranches: layout.indel_tranches(),
            model_report: None,
        };
        let config = self.ctx.config();
        let invocation = self
            .recalibrator(
                TaskKind::IndelsVariantRecalibrator,
                VariantClass::Indel,
                &config.recalibration.indel,
                &config.resources.indel,
                sites_only,
            )
            .opt("-O", path_arg(&model.recal))
            .opt("--tranches-file", path_arg(&model.tranches))
            .output(model.recal.clone())
            .output(model.tranches.clone());

        self.ctx.execute(NodeKey::IndelModel, invocation).await?;
        info!("INDEL model trained");
        Ok(model)
    }

    pub async fn train_snp(
        &self,
        sites_only: &Artifact,
        shards: &[FilteredShard],
    ) -> Result<SnpRecalibration, StageError> {
        if self.decision.train_model {
            self.train_snp_scattered(sites_only, shards).await
        } else {
            self.train_snp_classic(sites_only).await
        }
    }

    async fn train_snp_classic(&self, sites_only: &Artifact) -> Result<SnpRecalibration, StageError> {
        let layout = self.ctx.layout();
        let model = RecalibrationModel {
            class: VariantClass::Snp,
            recal: layout.snp_recal(),
            tranches: layout.snp_tranches(),
            model_report: None,
        };
        let config = self.ctx.config();
        let invocation = self
            .recalibrator(
                TaskKind::SnpsVariantRecalibratorClassic,
                VariantClass::Snp,
                &config.recalibration.snp,
                &config.resources.snp,
                sites_only,
            )
            .opt("-O", path_arg(&model.recal))
            .opt("--tranches-file", path_arg(&model.tranches))
            .output(model.recal.clone())
            .output(model.tranches.clone());

        self.ctx.execute(NodeKey::SnpClassic, invocation).await?;
        info!("SNP model trained and scored in one pass");
        Ok(SnpRecalibration::Classic { model })
    }

    async fn train_snp_scattered(
        &self,
        sites_only: &Artifact,
        shards: &[FilteredShard],
    ) -> Result<SnpRecalibration, StageError> {
        let layout = self.ctx.layout();
        let config = self.ctx.config();
        let model_report = layout.snp_model_report();

        let create = self
            .recalibrator(
                TaskKind::SnpsVariantRecalibratorCreateModel,
                VariantClass::Snp,
                &config.recalibration.snp,
                &config.resources.snp,
                sites_only,
            )
            .opt("-O", path_arg(&layout.snp_recal()))
            .opt("--tranches-file", path_arg(&layout.snp_model_tranches()))
            .opt(
                "--sample-every-Nth-variant",
                config.thresholds.snp_downsample_factor,
            )
            .opt("--output-model", path_arg(&model_report))
            .output(model_report.clone());
        self.ctx.execute(NodeKey::SnpModel, create).await?;
        info!(
            downsample = config.thresholds.snp_downsample_factor,
            "reusable SNP model trained"
        );

        let scored = join_all(
            shards
                .iter()
                .map(|shard| self.score_snp_shard(shard, &model_report)),
        )
        .await;

        let mut recal_tables = BTreeMap::new();
        let mut shard_tranches = Vec::with_capacity(scored.len());
        for result in scored {
            match result {
                Ok((index, recal, tranches)) => {
                    recal_tables.insert(index, recal);
                    shard_tranches.push(tranches);
                }
                Err(_) => return Err(self.ctx.blocked(NodeKey::TrancheGather)),
            }
        }

        let tranches = self.gather_tranches(&shard_tranches).await?;
        Ok(SnpRecalibration::Scattered {
            model_report,
            shards: recal_tables,
            tranches,
        })
    }

    async fn score_snp_shard(
        &self,
        shard: &FilteredShard,
        model_report: &Artifact,
    ) -> Result<(ShardIndex, Artifact, Artifact), StageError> {
        let layout = self.ctx.layout();
        let config = self.ctx.config();
        let recal = layout.snp_recal_shard(shard.index);
        let tranches = layout.snp_tranches_shard(shard.index);

        let invocation = self
            .recalibrator(
                TaskKind::SnpsVariantRecalibratorScattered,
                VariantClass::Snp,
                &config.recalibration.snp,
                &config.resources.snp,
                &shard.sites_only,
            )
            .for_shard(shard.index)
            .opt("-O", path_arg(&recal))
            .opt("--tranches-file", path_arg(&tranches))
            .opt("--input-model", path_arg(model_report))
            .input(model_report.clone())
            .output(recal.clone())
            .output(tranches.clone());

        self.ctx
            .execute(NodeKey::SnpScattered(shard.index), invocation)
            .await?;
        debug!(shard = %shard.index, "SNP shard scored with reusable model");
        Ok((shard.index, recal, tranches))
    }

    async fn gather_tranches(&self, shard_tranches: &[Artifact]) -> Result<Artifact, StageError> {
        self.ctx
            .reach_barrier(Barrier::TrancheGather, shard_tranches.len())
            .await;

        let output = self.ctx.layout().snp_tranches();
        let mut invocation = self.ctx.gatk(TaskKind::GatherTranches, "GatherTranches");
        for tranches in shard_tranches {
            invocation = invocation
                .opt("--tranches-file", path_arg(tranches))
                .input(tranches.clone());
        }
        let invocation = invocation
            .opt("--mode", VariantClass::Snp.mode())
            .opt("--output", path_arg(&output))
            .output(output.clone());

        self.ctx
            .execute(NodeKey::TrancheGather, invocation)
            .instrument(barrier_span(Barrier::TrancheGather.as_str(), shard_tranches.len()))
            .await?;
        Ok(output)
    }

    /// apply-INDEL then apply-SNP on one shard.
    async fn apply_shard<I, S>(
        &self,
        shard: &FilteredShard,
        indel: I,
        snp: S,
    ) -> Result<RecalibratedShard, StageError>
    where
        I: Future<Output = Result<RecalibrationModel, StageError>>,
        S: Future<Output = Result<SnpRecalibration, StageError>>,
    {
        let layout = self.ctx.layout();
        let indel_node = NodeKey::ApplyIndel(shard.index);
        let snp_node = NodeKey::ApplySnp(shard.index);

        let indel = indel.await.map_err(|_| self.ctx.blocked(indel_node))?;
        let intermediate = layout.indel_recalibrated(shard.index);
        let invocation = self.apply_invocation(
            TaskKind::ApplyIndelRecalibration,
            shard.index,
            &shard.filtered,
            &indel,
            &intermediate,
        );
        self.ctx.execute(indel_node, invocation).await?;
        debug!(shard = %shard.index, "INDEL recalibration applied");

        let snp = snp.await.map_err(|_| self.ctx.blocked(snp_node))?;
        let Some(snp) = snp.model_for(shard.index) else {
            return Err(self.ctx.blocked(snp_node));
        };
        let output = layout.recalibrated(shard.index);
        let invocation = self.apply_invocation(
            TaskKind::ApplySnpRecalibration,
            shard.index,
            &intermediate,
            &snp,
            &output,
        );
        self.ctx.execute(snp_node, invocation).await?;
        debug!(shard = %shard.index, "SNP recalibration applied");

        Ok(RecalibratedShard {
            index: shard.index,
            vcf: output,
        })
    }

    /// Common training arguments. The input VCF is the first declared input.
    fn recalibrator(
        &self,
        kind: TaskKind,
        class: VariantClass,
        settings: &ModelSettings,
        resources: &[TrainingResource],
        sites_only: &Artifact,
    ) -> ToolInvocation {
        let mut invocation = self
            .ctx
            .gatk(kind, "VariantRecalibrator")
            .opt("-V", path_arg(sites_only))
            .input(sites_only.clone())
            .arg("--trust-all-polymorphic");
        for tranche in &settings.tranches {
            invocation = invocation.opt("-tranche", tranche);
        }
        for annotation in &settings.annotations {
            invocation = invocation.opt("-an", annotation);
        }
        invocation = invocation
            .opt("-mode", class.mode())
            .opt("--max-gaussians", settings.max_gaussians);
        for resource in resources {
            invocation = invocation
                .opt(
                    &format!("--resource:{}", resource.resource_tag()),
                    resource.path.display(),
                )
                .input(Artifact::vcf(&resource.path));
        }
        invocation
    }

    /// Annotate `input` with `model` at the class's sensitivity level. Nothing is removed.
    fn apply_invocation(
        &self,
        kind: TaskKind,
        shard: ShardIndex,
        input: &Artifact,
        model: &RecalibrationModel,
        output: &Artifact,
    ) -> ToolInvocation {
        let thresholds = &self.ctx.config().thresholds;
        let level = match model.class {
            VariantClass::Indel => thresholds.indel_filter_level,
            VariantClass::Snp => thresholds.snp_filter_level,
        };
        self.ctx
            .gatk(kind, "ApplyVQSR")
            .for_shard(shard)
            .opt("-O", path_arg(output))
            .opt("-V", path_arg(input))
            .opt("--recal-file", path_arg(&model.recal))
            .opt("--tranches-file", path_arg(&model.tranches))
            .opt("--truth-sensitivity-filter-level", level)
            .opt("--create-output-variant-index", "true")
            .opt("-mode", model.class.mode())
            .input(input.clone())
            .input(model.recal.clone())
            .input(model.tranches.clone())
            .output(output.clone())
    }
}
