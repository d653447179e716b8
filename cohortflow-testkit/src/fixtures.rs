use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use cohortflow::{
    CohortSampleMap, GenomicInterval, InMemoryBudget, InProcEventBus, JointCallingOrchestrator,
    PipelineConfig, SampleEntry, TaskClass, TaskRunner, TaskRunnerBuilder,
};

use crate::executor::SimulatedToolExecutor;

pub type SimulatedRunner = TaskRunner<SimulatedToolExecutor, InMemoryBudget<TaskClass>>;
pub type SimulatedOrchestrator =
    JointCallingOrchestrator<SimulatedToolExecutor, InMemoryBudget<TaskClass>>;

/// Run configuration used by the simulated runs. Paths are relative and get
/// resolved against `base`; nothing is read from disk.
pub const TEST_CONFIG: &str = r#"
[cohort]
callset_name = "cohort"
sample_map = "samples.tsv"
intervals = "calling.interval_list"
output_dir = "out"

[reference]
fasta = "Homo_sapiens_assembly38.fasta"
dbsnp_vcf = "dbsnp138.vcf.gz"
eval_interval_list = "evaluation.interval_list"

[[resources.snp]]
name = "hapmap"
path = "hapmap_3.3.vcf.gz"
training = true
truth = true
prior = 15.0

[[resources.snp]]
name = "dbsnp"
path = "dbsnp138.vcf.gz"
known = true
prior = 7.0

[[resources.indel]]
name = "mills"
path = "Mills_and_1000G_gold_standard.indels.vcf.gz"
training = true
truth = true
prior = 12.0

[retry]
max_attempts = 5
backoff_ms = 1

[runner]
max_concurrent_tasks = 16
"#;

pub fn test_config(base: &Path) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_toml_str(TEST_CONFIG)?;
    config.resolve_paths(base);
    Ok(config)
}

/// `count` back-to-back intervals of `width` bases on one chromosome, starting at 1.
pub fn adjacent_intervals(chromosome: &str, count: usize, width: u64) -> Result<Vec<GenomicInterval>> {
    (0..count as u64)
        .map(|i| {
            let start = i * width + 1;
            Ok(GenomicInterval::new(chromosome, start, start + width - 1)?)
        })
        .collect()
}

/// A cohort of `n` samples named `sample_0000` onwards.
pub fn sample_map(n: usize) -> Result<CohortSampleMap> {
    let entries = (0..n)
        .map(|i| SampleEntry {
            sample: format!("sample_{i:04}"),
            gvcf: PathBuf::from(format!("gvcfs/sample_{i:04}.g.vcf.gz")),
        })
        .collect();
    Ok(CohortSampleMap::from_entries(entries)?)
}

/// Orchestrator wired to `executor`, plus the event bus it publishes to.
pub fn simulated_orchestrator(
    config: PipelineConfig,
    executor: SimulatedToolExecutor,
) -> Result<(SimulatedOrchestrator, Arc<InProcEventBus>)> {
    let events = Arc::new(InProcEventBus::new(config.runner.event_capacity));
    let runner: SimulatedRunner =
        TaskRunnerBuilder::<SimulatedToolExecutor, InMemoryBudget<TaskClass>>::new(
            config.runner_config(),
        )
        .with_executor(Arc::new(executor))
        .with_in_memory_budget()
        .with_events(events.clone())
        .build()?;
    Ok((JointCallingOrchestrator::new(config, runner), events))
}
