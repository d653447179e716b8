use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

use crate::artifact::Artifact;

/// Identifier for one orchestrator run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one external tool invocation (shared by all of its attempts).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a shard in the plan. Interval shards and filtered-VCF shards
/// share the index space because each filtered shard is produced by exactly
/// one interval chain.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct ShardIndex(pub usize);

impl Display for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Every external tool call the orchestrator knows how to issue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ImportGvcfs,
    GenotypeGvcfs,
    HardFilterAndMakeSitesOnly,
    SitesOnlyGather,
    IndelsVariantRecalibrator,
    SnpsVariantRecalibratorCreateModel,
    SnpsVariantRecalibratorScattered,
    SnpsVariantRecalibratorClassic,
    GatherTranches,
    ApplyIndelRecalibration,
    ApplySnpRecalibration,
    FinalGatherVcf,
    SelectSamples,
    CollectMetricsOnFullVcf,
    CollectMetricsSharded,
    GatherMetrics,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImportGvcfs => "import_gvcfs",
            TaskKind::GenotypeGvcfs => "genotype_gvcfs",
            TaskKind::HardFilterAndMakeSitesOnly => "hard_filter_and_make_sites_only",
            TaskKind::SitesOnlyGather => "sites_only_gather",
            TaskKind::IndelsVariantRecalibrator => "indels_variant_recalibrator",
            TaskKind::SnpsVariantRecalibratorCreateModel => {
                "snps_variant_recalibrator_create_model"
            }
            TaskKind::SnpsVariantRecalibratorScattered => {
                "snps_variant_recalibrator_scattered"
            }
            TaskKind::SnpsVariantRecalibratorClassic => "snps_variant_recalibrator_classic",
            TaskKind::GatherTranches => "gather_tranches",
            TaskKind::ApplyIndelRecalibration => "apply_indel_recalibration",
            TaskKind::ApplySnpRecalibration => "apply_snp_recalibration",
            TaskKind::FinalGatherVcf => "final_gather_vcf",
            TaskKind::SelectSamples => "select_samples",
            TaskKind::CollectMetricsOnFullVcf => "collect_metrics_on_full_vcf",
            TaskKind::CollectMetricsSharded => "collect_metrics_sharded",
            TaskKind::GatherMetrics => "gather_metrics",
        }
    }

    /// Resource class used for budgets, sizing and preemption limits.
    pub fn class(&self) -> TaskClass {
        match self {
            TaskKind::ImportGvcfs => TaskClass::Import,
            TaskKind::GenotypeGvcfs => TaskClass::Genotype,
            TaskKind::HardFilterAndMakeSitesOnly => TaskClass::HardFilter,
            TaskKind::SitesOnlyGather
            | TaskKind::GatherTranches
            | TaskKind::FinalGatherVcf
            | TaskKind::SelectSamples => TaskClass::Gather,
            TaskKind::IndelsVariantRecalibrator
            | TaskKind::SnpsVariantRecalibratorCreateModel
            | TaskKind::SnpsVariantRecalibratorScattered
            | TaskKind::SnpsVariantRecalibratorClassic => TaskClass::Recalibrate,
            TaskKind::ApplyIndelRecalibration | TaskKind::ApplySnpRecalibration => {
                TaskClass::Apply
            }
            TaskKind::CollectMetricsOnFullVcf
            | TaskKind::CollectMetricsSharded
            | TaskKind::GatherMetrics => TaskClass::Metrics,
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resource class of a task.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Import,
    Genotype,
    HardFilter,
    Gather,
    Recalibrate,
    Apply,
    Metrics,
}

impl TaskClass {
    pub const ALL: [TaskClass; 7] = [
        TaskClass::Import,
        TaskClass::Genotype,
        TaskClass::HardFilter,
        TaskClass::Gather,
        TaskClass::Recalibrate,
        TaskClass::Apply,
        TaskClass::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskClass::Import => "import",
            TaskClass::Genotype => "genotype",
            TaskClass::HardFilter => "hard_filter",
            TaskClass::Gather => "gather",
            TaskClass::Recalibrate => "recalibrate",
            TaskClass::Apply => "apply",
            TaskClass::Metrics => "metrics",
        }
    }
}

impl Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single external tool call: what to run, what it reads and what it must produce.
///
/// `outputs` is the declared output contract. The runner refuses to report
/// success unless every declared output was produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: TaskId,
    pub kind: TaskKind,
    pub shard: Option<ShardIndex>,
    pub program: String,
    pub args: Vec<String>,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<Artifact>,
}

impl ToolInvocation {
    pub fn new(kind: TaskKind, program: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            shard: None,
            program: program.into(),
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn for_shard(mut self, shard: ShardIndex) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a flag followed by its value.
    pub fn opt(mut self, flag: &str, value: impl ToString) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
        self
    }

    pub fn input(mut self, artifact: Artifact) -> Self {
        self.inputs.push(artifact);
        self
    }

    pub fn output(mut self, artifact: Artifact) -> Self {
        self.outputs.push(artifact);
        self
    }

    pub fn class(&self) -> TaskClass {
        self.kind.class()
    }

    /// Short human label, e.g. `genotype_gvcfs[3]`.
    pub fn label(&self) -> String {
        match self.shard {
            Some(shard) => format!("{}[{}]", self.kind, shard),
            None => self.kind.to_string(),
        }
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}
