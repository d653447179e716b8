//! Run configuration.
//!
//! A run is described by one TOML file. Relative paths in the file are
//! resolved against the directory that contains it.
//!
//! ```toml
//! [cohort]
//! callset_name = "cohort"
//! sample_map = "samples.tsv"
//! intervals = "calling.interval_list"
//! output_dir = "out"
//!
//! [reference]
//! fasta = "ref/Homo_sapiens_assembly38.fasta"
//! dbsnp_vcf = "ref/dbsnp138.vcf.gz"
//! eval_interval_list = "ref/eval.interval_list"
//!
//! [[resources.snp]]
//! name = "hapmap"
//! path = "ref/hapmap_3.3.hg38.vcf.gz"
//! training = true
//! truth = true
//! prior = 15.0
//!
//! [tasks.recalibrate]
//! memory_mb = 104000
//! max_retries = 1
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::interval::MergeCount;
use crate::retry::TransientRetryPolicy;
use crate::router::RoutingThresholds;
use crate::runtime::{ResourceProfile, RunnerConfig};
use crate::task::TaskClass;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CohortConfig {
    pub callset_name: String,
    /// Two-column `sample<TAB>gvcf` file.
    pub sample_map: PathBuf,
    pub intervals: PathBuf,
    pub output_dir: PathBuf,
    /// Restrict the merged small-cohort VCF to these samples.
    #[serde(default)]
    pub select_samples_expression: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub fasta: PathBuf,
    /// Known sites passed to genotyping and metrics collection.
    pub dbsnp_vcf: PathBuf,
    /// Interval list metrics are evaluated over.
    pub eval_interval_list: PathBuf,
}

/// One truth/training resource for a recalibration model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingResource {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub known: bool,
    #[serde(default)]
    pub training: bool,
    #[serde(default)]
    pub truth: bool,
    pub prior: f64,
}

impl TrainingResource {
    /// The `--resource:` argument value, e.g. `hapmap,known=false,training=true,truth=true,prior=15`.
    pub fn resource_tag(&self) -> String {
        format!(
            "{},known={},training={},truth={},prior={}",
            self.name, self.known, self.training, self.truth, self.prior
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub snp: Vec<TrainingResource>,
    pub indel: Vec<TrainingResource>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub excess_het_threshold: f64,
    pub snp_filter_level: f64,
    pub indel_filter_level: f64,
    /// Keep every Nth site when training the reusable SNP model.
    pub snp_downsample_factor: u32,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            excess_het_threshold: 54.69,
            snp_filter_level: 99.7,
            indel_filter_level: 99.7,
            snp_downsample_factor: 10,
        }
    }
}

/// Training parameters for one variant class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub tranches: Vec<String>,
    pub annotations: Vec<String>,
    pub max_gaussians: u32,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl ModelSettings {
    pub fn indel_defaults() -> Self {
        Self {
            tranches: strings(&[
                "100.0", "99.95", "99.9", "99.5", "99.0", "97.0", "96.0", "95.0", "94.0", "93.5",
                "93.0", "92.0", "91.0", "90.0",
            ]),
            annotations: strings(&["FS", "ReadPosRankSum", "MQRankSum", "QD", "SOR", "DP"]),
            max_gaussians: 4,
        }
    }

    pub fn snp_defaults() -> Self {
        Self {
            tranches: strings(&[
                "100.0", "99.95", "99.9", "99.8", "99.6", "99.5", "99.4", "99.3", "99.0", "98.0",
                "97.0", "90.0",
            ]),
            annotations: strings(&["QD", "MQRankSum", "ReadPosRankSum", "FS", "MQ", "SOR", "DP"]),
            max_gaussians: 6,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalibrationConfig {
    pub snp: ModelSettings,
    pub indel: ModelSettings,
}

impl Default for RecalibrationConfig {
    fn default() -> Self {
        Self {
            snp: ModelSettings::snp_defaults(),
            indel: ModelSettings::indel_defaults(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterConfig {
    pub merge_count: MergeCount,
    /// Samples read per batch during workspace import.
    pub import_batch_size: u32,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            merge_count: MergeCount::default(),
            import_batch_size: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub max_concurrent_tasks: usize,
    pub class_limits: BTreeMap<TaskClass, usize>,
    pub event_capacity: usize,
}

impl Default for RunnerSection {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            max_concurrent_tasks: runner.max_concurrent_tasks,
            class_limits: runner.class_limits,
            event_capacity: 1024,
        }
    }
}

/// External programs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub gatk: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            gatk: "gatk".to_string(),
        }
    }
}

/// Everything a run needs, as loaded from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub cohort: CohortConfig,
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub recalibration: RecalibrationConfig,
    #[serde(default)]
    pub routing: RoutingThresholds,
    #[serde(default)]
    pub scatter: ScatterConfig,
    #[serde(default)]
    pub retry: TransientRetryPolicy,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Per-class overrides; unset classes use built-in sizing.
    #[serde(default)]
    pub tasks: BTreeMap<TaskClass, ResourceProfile>,
}

impl PipelineConfig {
    /// Read and parse a TOML file, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: PipelineConfig = toml::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.cohort.sample_map);
        resolve(&mut self.cohort.intervals);
        resolve(&mut self.cohort.output_dir);
        resolve(&mut self.reference.fasta);
        resolve(&mut self.reference.dbsnp_vcf);
        resolve(&mut self.reference.eval_interval_list);
        for resource in self.resources.snp.iter_mut().chain(self.resources.indel.iter_mut()) {
            resolve(&mut resource.path);
        }
    }

    /// Check ranges and that every referenced input file exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cohort.callset_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cohort.callset_name is empty".into()));
        }
        for (name, level) in [
            ("snp_filter_level", self.thresholds.snp_filter_level),
            ("indel_filter_level", self.thresholds.indel_filter_level),
        ] {
            if !(level > 0.0 && level <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{name} must be in (0, 100], got {level}"
                )));
            }
        }
        if self.thresholds.snp_downsample_factor == 0 {
            return Err(ConfigError::Invalid(
                "thresholds.snp_downsample_factor must be at least 1".into(),
            ));
        }
        if let MergeCount::Fixed { count: 0 } = self.scatter.merge_count {
            return Err(ConfigError::Invalid("scatter.merge_count must be at least 1".into()));
        }
        if self.runner.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid("runner.max_concurrent_tasks must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.routing.small_cohort_max_samples > self.routing.snp_model_training_threshold {
            return Err(ConfigError::Invalid(
                "routing.small_cohort_max_samples exceeds routing.snp_model_training_threshold"
                    .into(),
            ));
        }
        if self.resources.snp.is_empty() {
            return Err(ConfigError::Invalid("no SNP training resources configured".into()));
        }
        if self.resources.indel.is_empty() {
            return Err(ConfigError::Invalid("no INDEL training resources configured".into()));
        }

        require_file("sample map", &self.cohort.sample_map)?;
        require_file("interval list", &self.cohort.intervals)?;
        require_file("reference fasta", &self.reference.fasta)?;
        require_file("known-sites VCF", &self.reference.dbsnp_vcf)?;
        require_file("evaluation interval list", &self.reference.eval_interval_list)?;
        for resource in self.resources.snp.iter().chain(&self.resources.indel) {
            require_file(&format!("training resource `{}`", resource.name), &resource.path)?;
        }
        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_concurrent_tasks: self.runner.max_concurrent_tasks,
            class_limits: self.runner.class_limits.clone(),
            transient: self.retry.clone(),
            profiles: self.tasks.clone(),
        }
    }
}

fn require_file(what: &str, path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ConfigError::MissingFile {
            what: what.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// One row of the sample map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    pub sample: String,
    pub gvcf: PathBuf,
}

/// The cohort: sample names mapped to their per-sample call files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CohortSampleMap {
    entries: Vec<SampleEntry>,
}

impl CohortSampleMap {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(std::io::BufReader::new(file))
    }

    /// Parse `sample<TAB>path` rows. Blank lines and `#` comments are skipped;
    /// a sample name may appear only once.
    pub fn parse(reader: impl BufRead) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for (i, line) in reader.lines().enumerate() {
            let line_no = i + 1;
            let line = line.map_err(|err| ConfigError::SampleMap {
                line: line_no,
                reason: err.to_string(),
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut fields = trimmed.split('\t');
            let (Some(sample), Some(gvcf), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(ConfigError::SampleMap {
                    line: line_no,
                    reason: "expected two tab-separated columns".into(),
                });
            };
            let (sample, gvcf) = (sample.trim(), gvcf.trim());
            if sample.is_empty() || gvcf.is_empty() {
                return Err(ConfigError::SampleMap {
                    line: line_no,
                    reason: "empty sample name or path".into(),
                });
            }
            if !seen.insert(sample.to_string()) {
                return Err(ConfigError::DuplicateSample(sample.to_string()));
            }
            entries.push(SampleEntry {
                sample: sample.to_string(),
                gvcf: PathBuf::from(gvcf),
            });
        }

        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<SampleEntry>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.sample.as_str()) {
                return Err(ConfigError::DuplicateSample(entry.sample.clone()));
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SampleEntry] {
        &self.entries
    }

    pub fn samples(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.sample.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MINIMAL: &str = r#"
[cohort]
callset_name = "trio"
sample_map = "samples.tsv"
intervals = "calling.interval_list"
output_dir = "out"

[reference]
fasta = "ref.fasta"
dbsnp_vcf = "dbsnp.vcf.gz"
eval_interval_list = "eval.interval_list"

[[resources.snp]]
name = "hapmap"
path = "hapmap.vcf.gz"
training = true
truth = true
prior = 15.0

[[resources.indel]]
name = "mills"
path = "mills.vcf.gz"
training = true
truth = true
prior = 12.0
"#;

    fn write_inputs(dir: &Path) {
        for name in [
            "samples.tsv",
            "calling.interval_list",
            "ref.fasta",
            "dbsnp.vcf.gz",
            "eval.interval_list",
            "hapmap.vcf.gz",
            "mills.vcf.gz",
        ] {
            fs::write(dir.join(name), "").unwrap();
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.thresholds.excess_het_threshold, 54.69);
        assert_eq!(config.thresholds.snp_filter_level, 99.7);
        assert_eq!(config.thresholds.snp_downsample_factor, 10);
        assert_eq!(config.scatter.merge_count, MergeCount::Fixed { count: 3 });
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.routing.snp_model_training_threshold, 10500);
        assert_eq!(config.recalibration.indel.max_gaussians, 4);
        assert_eq!(config.recalibration.snp.max_gaussians, 6);
        assert_eq!(config.tools.gatk, "gatk");
    }

    #[test]
    fn test_overrides_and_task_profiles() {
        let text = format!(
            "{MINIMAL}\n[scatter]\nmerge_count = {{ strategy = \"derived\" }}\n\n[retry]\nmax_attempts = 3\nbackoff_ms = 10\n\n[tasks.recalibrate]\ncpu = 4\nmax_retries = 0\n"
        );
        let config = PipelineConfig::from_toml_str(&text).unwrap();

        assert_eq!(config.scatter.merge_count, MergeCount::Derived);
        let runner = config.runner_config();
        assert_eq!(runner.transient.max_attempts, 3);
        assert_eq!(runner.profile(TaskClass::Recalibrate).cpu, 4);
        assert_eq!(runner.profile(TaskClass::Recalibrate).max_retries, 0);
        assert_eq!(runner.profile(TaskClass::Apply).max_retries, 2);
    }

    #[test]
    fn test_load_resolves_relative_paths_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        let config_path = dir.path().join("run.toml");
        fs::write(&config_path, MINIMAL).unwrap();

        let config = PipelineConfig::load(&config_path).unwrap();

        assert_eq!(config.cohort.sample_map, dir.path().join("samples.tsv"));
        assert_eq!(config.resources.snp[0].path, dir.path().join("hapmap.vcf.gz"));
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_resource_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        fs::remove_file(dir.path().join("mills.vcf.gz")).unwrap();
        let config_path = dir.path().join("run.toml");
        fs::write(&config_path, MINIMAL).unwrap();

        let err = PipelineConfig::load(&config_path).unwrap().validate().unwrap_err();

        assert!(matches!(err, ConfigError::MissingFile { .. }));
        assert!(err.to_string().contains("mills"));
    }

    #[test]
    fn test_invalid_filter_level_is_rejected() {
        let mut config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        config.thresholds.indel_filter_level = 120.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resource_tag() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(
            config.resources.snp[0].resource_tag(),
            "hapmap,known=false,training=true,truth=true,prior=15"
        );
    }

    #[test]
    fn test_sample_map_parse() {
        let text = "# cohort\nNA12878\t/data/NA12878.g.vcf.gz\n\nNA12891\t/data/NA12891.g.vcf.gz\n";
        let map = CohortSampleMap::parse(Cursor::new(text)).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.samples().collect::<Vec<_>>(), vec!["NA12878", "NA12891"]);
    }

    #[test]
    fn test_sample_map_rejects_duplicates_and_bad_rows() {
        let dup = "a\t/a.g.vcf.gz\na\t/b.g.vcf.gz\n";
        assert!(matches!(
            CohortSampleMap::parse(Cursor::new(dup)),
            Err(ConfigError::DuplicateSample(name)) if name == "a"
        ));

        let bad = "only-one-column\n";
        assert!(matches!(
            CohortSampleMap::parse(Cursor::new(bad)),
            Err(ConfigError::SampleMap { line: 1, .. })
        ));
    }
}
