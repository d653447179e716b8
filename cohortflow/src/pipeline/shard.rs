use futures::future::join_all;
use serde::Serialize;
use tracing::{Instrument, debug, info};

use crate::artifact::Artifact;
use crate::budget::Budget;
use crate::events::Barrier;
use crate::graph::NodeKey;
use crate::interval::IntervalChain;
use crate::runtime::ToolExecutor;
use crate::task::{ShardIndex, TaskClass, TaskKind, ToolInvocation};
use crate::telemetry::{barrier_span, shard_span};

use super::{StageContext, StageError, path_arg, shell_chain};

/// One planned interval chain and its position in the plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntervalShard {
    pub index: ShardIndex,
    pub chain: IntervalChain,
}

impl IntervalShard {
    pub fn from_chains(chains: Vec<IntervalChain>) -> Vec<IntervalShard> {
        chains
            .into_iter()
            .enumerate()
            .map(|(i, chain)| IntervalShard {
                index: ShardIndex(i),
                chain,
            })
            .collect()
    }
}

/// Everything one interval shard hands to the recalibration phase, in one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FilteredShard {
    pub index: ShardIndex,
    pub chain: IntervalChain,
    /// Flagged VCF with genotypes; recalibration is applied to this.
    pub filtered: Artifact,
    /// Sites-only copy used for model training.
    pub sites_only: Artifact,
}

/// import → genotype → hard filter for each interval chain.
///
/// Shards share nothing but read-only reference inputs, so every shard runs
/// concurrently, bounded only by the runner's compute budget.
pub struct ShardPipeline<'a, E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    ctx: &'a StageContext<E, B>,
}

impl<'a, E, B> ShardPipeline<'a, E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    pub fn new(ctx: &'a StageContext<E, B>) -> Self {
        Self { ctx }
    }

    /// Run every shard to completion or failure. Results come back in shard order.
    pub async fn run_all(&self, shards: &[IntervalShard]) -> Vec<Result<FilteredShard, StageError>> {
        join_all(shards.iter().map(|shard| self.run(shard))).await
    }

    pub async fn run(&self, shard: &IntervalShard) -> Result<FilteredShard, StageError> {
        let span = shard_span(shard.index.0, shard.chain.to_string());
        async {
            let layout = self.ctx.layout();
            let workspace = layout.workspace(shard.index);
            let genotyped = layout.genotyped(shard.index);

            self.ctx
                .execute(NodeKey::Import(shard.index), self.import_invocation(shard))
                .await?;
            debug!(shard = %shard.index, "workspace imported");

            self.ctx
                .execute(
                    NodeKey::Genotype(shard.index),
                    self.genotype_invocation(shard, &workspace),
                )
                .await?;

            self.ctx
                .execute(
                    NodeKey::HardFilter(shard.index),
                    self.hard_filter_invocation(shard, &genotyped),
                )
                .await?;
            info!(shard = %shard.index, interval = %shard.chain, "shard filtered");

            Ok(FilteredShard {
                index: shard.index,
                chain: shard.chain.clone(),
                filtered: layout.filtered(shard.index),
                sites_only: layout.sites_only(shard.index),
            })
        }
        .instrument(span)
        .await
    }

    /// Fan-in of every shard's sites-only VCF into one file for model training.
    ///
    /// Waits on the full result set; if any shard failed the gather node has
    /// already been aborted and this returns `Blocked`.
    pub async fn gather_sites_only(
        &self,
        shards: &[Result<FilteredShard, StageError>],
    ) -> Result<Artifact, StageError> {
        let node = NodeKey::SitesOnlyGather;
        let mut inputs = Vec::with_capacity(shards.len());
        for shard in shards {
            match shard {
                Ok(shard) => inputs.push(shard.sites_only.clone()),
                Err(_) => return Err(self.ctx.blocked(node)),
            }
        }

        self.ctx.reach_barrier(Barrier::SitesOnlyGather, inputs.len()).await;
        let output = self.ctx.layout().gathered_sites_only();
        let invocation = gather_vcfs_invocation(
            TaskKind::SitesOnlyGather,
            &self.ctx.config().tools.gatk,
            &inputs,
            &output,
        );
        self.ctx
            .execute(node, invocation)
            .instrument(barrier_span(Barrier::SitesOnlyGather.as_str(), inputs.len()))
            .await?;
        Ok(output)
    }

    /// Import the cohort's per-sample calls for this chain and archive the workspace.
    pub fn import_invocation(&self, shard: &IntervalShard) -> ToolInvocation {
        let config = self.ctx.config();
        let archive = self.ctx.layout().workspace(shard.index);
        let workspace_dir = archive.primary.with_extension("");
        let sample_map = Artifact::plain(&config.cohort.sample_map);

        shell_chain(
            TaskKind::ImportGvcfs,
            &[
                vec!["rm".into(), "-rf".into(), workspace_dir.display().to_string()],
                vec![
                    config.tools.gatk.clone(),
                    "GenomicsDBImport".into(),
                    "--genomicsdb-workspace-path".into(),
                    workspace_dir.display().to_string(),
                    "--batch-size".into(),
                    config.scatter.import_batch_size.to_string(),
                    "-L".into(),
                    shard.chain.to_string(),
                    "--sample-name-map".into(),
                    path_arg(&sample_map),
                    "--reader-threads".into(),
                    "5".into(),
                    "--merge-input-intervals".into(),
                    "--consolidate".into(),
                ],
                tar_create(&archive, &workspace_dir),
            ],
        )
        .for_shard(shard.index)
        .input(sample_map)
        .output(archive)
    }

    /// Joint-genotype the shard's workspace, emitting only calls that start in the chain.
    pub fn genotype_invocation(&self, shard: &IntervalShard, workspace: &Artifact) -> ToolInvocation {
        let config = self.ctx.config();
        let output = self.ctx.layout().genotyped(shard.index);
        let workspace_dir = workspace.primary.with_extension("");
        let reference = Artifact::indexed(
            &config.reference.fasta,
            reference_index(&config.reference.fasta),
        );
        let dbsnp = Artifact::vcf(&config.reference.dbsnp_vcf);

        shell_chain(
            TaskKind::GenotypeGvcfs,
            &[
                tar_extract(workspace, &workspace_dir),
                vec![
                    config.tools.gatk.clone(),
                    "GenotypeGVCFs".into(),
                    "-R".into(),
                    path_arg(&reference),
                    "-O".into(),
                    path_arg(&output),
                    "-D".into(),
                    path_arg(&dbsnp),
                    "-G".into(),
                    "StandardAnnotation".into(),
                    "-G".into(),
                    "AS_StandardAnnotation".into(),
                    "--only-output-calls-starting-in-intervals".into(),
                    "-V".into(),
                    format!("gendb://{}", workspace_dir.display()),
                    "-L".into(),
                    shard.chain.to_string(),
                    "--merge-input-intervals".into(),
                ],
            ],
        )
        .for_shard(shard.index)
        .input(workspace.clone())
        .input(reference)
        .input(dbsnp)
        .output(output)
    }

    /// Flag (never drop) excess-heterozygosity sites, then strip genotypes.
    pub fn hard_filter_invocation(&self, shard: &IntervalShard, genotyped: &Artifact) -> ToolInvocation {
        let config = self.ctx.config();
        let filtered = self.ctx.layout().filtered(shard.index);
        let sites_only = self.ctx.layout().sites_only(shard.index);

        shell_chain(
            TaskKind::HardFilterAndMakeSitesOnly,
            &[
                vec![
                    config.tools.gatk.clone(),
                    "VariantFiltration".into(),
                    "--filter-expression".into(),
                    format!("ExcessHet > {}", config.thresholds.excess_het_threshold),
                    "--filter-name".into(),
                    "ExcessHet".into(),
                    "-O".into(),
                    path_arg(&filtered),
                    "-V".into(),
                    path_arg(genotyped),
                ],
                vec![
                    config.tools.gatk.clone(),
                    "MakeSitesOnlyVcf".into(),
                    "-I".into(),
                    path_arg(&filtered),
                    "-O".into(),
                    path_arg(&sites_only),
                ],
            ],
        )
        .for_shard(shard.index)
        .input(genotyped.clone())
        .output(filtered)
        .output(sites_only)
    }
}

/// Block-gather `inputs` (in genomic order) into `output` and index it.
pub(crate) fn gather_vcfs_invocation(
    kind: TaskKind,
    gatk: &str,
    inputs: &[Artifact],
    output: &Artifact,
) -> ToolInvocation {
    let mut gather = vec![
        gatk.to_string(),
        "GatherVcfsCloud".into(),
        "--ignore-safety-checks".into(),
        "--gather-type".into(),
        "BLOCK".into(),
    ];
    for input in inputs {
        gather.push("--input".into());
        gather.push(path_arg(input));
    }
    gather.push("--output".into());
    gather.push(path_arg(output));

    let index = vec![
        "tabix".into(),
        "-p".into(),
        "vcf".into(),
        path_arg(output),
    ];

    inputs
        .iter()
        .cloned()
        .fold(shell_chain(kind, &[gather, index]), ToolInvocation::input)
        .output(output.clone())
}

fn reference_index(fasta: &std::path::Path) -> std::path::PathBuf {
    let mut name = fasta.as_os_str().to_os_string();
    name.push(".fai");
    name.into()
}

fn tar_create(archive: &Artifact, dir: &std::path::Path) -> Vec<String> {
    let parent = dir.parent().map(|p| p.display().to_string()).unwrap_or_else(|| ".".into());
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    vec!["tar".into(), "-cf".into(), path_arg(archive), "-C".into(), parent, name]
}

fn tar_extract(archive: &Artifact, dir: &std::path::Path) -> Vec<String> {
    let parent = dir.parent().map(|p| p.display().to_string()).unwrap_or_else(|| ".".into());
    vec!["tar".into(), "-xf".into(), path_arg(archive), "-C".into(), parent]
}
