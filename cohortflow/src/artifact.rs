//! File artifacts exchanged between tasks.
//!
//! Artifacts are opaque to the orchestrator. An artifact is a primary file
//! plus, for indexed formats, its index sibling. Once a task has produced an
//! artifact nothing rewrites it; consumers receive it by value.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::task::ShardIndex;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub primary: PathBuf,
    pub index: Option<PathBuf>,
}

impl Artifact {
    pub fn indexed(primary: impl Into<PathBuf>, index: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            index: Some(index.into()),
        }
    }

    /// A VCF-like file whose index sibling follows the usual naming rule.
    pub fn vcf(primary: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        let index = index_sibling(&primary);
        Self {
            primary,
            index: Some(index),
        }
    }

    /// A file that has no index (tranches, model reports, metrics, archives).
    pub fn plain(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            index: None,
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.primary.as_path()).chain(self.index.as_deref())
    }

    /// Files of this artifact that do not exist on the local filesystem.
    pub fn missing_files(&self) -> Vec<PathBuf> {
        self.files()
            .filter(|path| !path.exists())
            .map(Path::to_path_buf)
            .collect()
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index {
            Some(index) => write!(f, "{} (+{})", self.primary.display(), index.display()),
            None => write!(f, "{}", self.primary.display()),
        }
    }
}

/// Index path for a block-compressed or plain variant file.
///
/// `x.vcf.gz` is indexed by `x.vcf.gz.tbi`; anything else by `<file>.idx`.
pub fn index_sibling(primary: &Path) -> PathBuf {
    let mut name = primary.as_os_str().to_os_string();
    if primary.extension().is_some_and(|ext| ext == "gz") {
        name.push(".tbi");
    } else {
        name.push(".idx");
    }
    PathBuf::from(name)
}

/// Detail and summary calling-quality metrics files.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MetricsPair {
    /// `--OUTPUT` prefix the two files are named after.
    pub prefix: PathBuf,
    pub detail: Artifact,
    pub summary: Artifact,
}

impl MetricsPair {
    pub fn from_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = prefix.as_os_str().to_os_string();
            name.push(suffix);
            Artifact::plain(PathBuf::from(name))
        };
        Self {
            prefix: prefix.to_path_buf(),
            detail: with_suffix(".variant_calling_detail_metrics"),
            summary: with_suffix(".variant_calling_summary_metrics"),
        }
    }

    pub fn artifacts(&self) -> [&Artifact; 2] {
        [&self.detail, &self.summary]
    }
}

/// Naming scheme for every artifact one run produces.
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    output_dir: PathBuf,
    callset: String,
}

impl ArtifactLayout {
    pub fn new(output_dir: impl Into<PathBuf>, callset: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            callset: callset.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn callset(&self) -> &str {
        &self.callset
    }

    fn path(&self, name: String) -> PathBuf {
        self.output_dir.join(name)
    }

    pub fn workspace(&self, shard: ShardIndex) -> Artifact {
        Artifact::plain(self.path(format!("genomicsdb.{shard}.tar")))
    }

    pub fn genotyped(&self, shard: ShardIndex) -> Artifact {
        Artifact::vcf(self.path(format!("{}.{shard}.vcf.gz", self.callset)))
    }

    pub fn filtered(&self, shard: ShardIndex) -> Artifact {
        Artifact::vcf(self.path(format!("{}.{shard}.variant_filtered.vcf.gz", self.callset)))
    }

    pub fn sites_only(&self, shard: ShardIndex) -> Artifact {
        Artifact::vcf(self.path(format!(
            "{}.{shard}.sites_only.variant_filtered.vcf.gz",
            self.callset
        )))
    }

    pub fn gathered_sites_only(&self) -> Artifact {
        Artifact::vcf(self.path(format!("{}.sites_only.vcf.gz", self.callset)))
    }

    pub fn indel_recal(&self) -> Artifact {
        Artifact::vcf(self.path(format!("{}.indels.recal", self.callset)))
    }

    pub fn indel_tranches(&self) -> Artifact {
        Artifact::plain(self.path(format!("{}.indels.tranches", self.callset)))
    }

    pub fn snp_model_report(&self) -> Artifact {
        Artifact::plain(self.path(format!("{}.snps.model.report", self.callset)))
    }

    /// Tranches written while training the reusable SNP model; not consumed downstream.
    pub fn snp_model_tranches(&self) -> Artifact {
        Artifact::plain(self.path(format!("{}.snps.model.tranches", self.callset)))
    }

    pub fn snp_recal(&self) -> Artifact {
        Artifact::vcf(self.path(format!("{}.snps.recal", self.callset)))
    }

    pub fn snp_tranches(&self) -> Artifact {
        Artifact::plain(self.path(format!("{}.snps.tranches", self.callset)))
    }

    pub fn snp_recal_shard(&self, shard: ShardIndex) -> Artifact {
        Artifact::vcf(self.path(format!("{}.snps.{shard}.recal", self.callset)))
    }

    pub fn snp_tranches_shard(&self, shard: ShardIndex) -> Artifact {
        Artifact::plain(self.path(format!("{}.snps.{shard}.tranches", self.callset)))
    }

    pub fn indel_recalibrated(&self, shard: ShardIndex) -> Artifact {
        Artifact::vcf(self.path(format!(
            "{}.{shard}.tmp.indel.recalibrated.vcf.gz",
            self.callset
        )))
    }

    pub fn recalibrated(&self, shard: ShardIndex) -> Artifact {
        Artifact::vcf(self.path(format!("{}.filtered.{shard}.vcf.gz", self.callset)))
    }

    pub fn merged(&self) -> Artifact {
        Artifact::vcf(self.path(format!("{}.vcf.gz", self.callset)))
    }

    pub fn selected(&self) -> Artifact {
        Artifact::vcf(self.path(format!("{}.selected.vcf.gz", self.callset)))
    }

    pub fn full_metrics(&self) -> MetricsPair {
        MetricsPair::from_prefix(&self.path(self.callset.clone()))
    }

    pub fn shard_metrics(&self, shard: ShardIndex) -> MetricsPair {
        MetricsPair::from_prefix(&self.path(format!("{}.{shard}", self.callset)))
    }

    pub fn gathered_metrics(&self) -> MetricsPair {
        MetricsPair::from_prefix(&self.path(format!("{}.gathered", self.callset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_sibling_rules() {
        assert_eq!(
            index_sibling(Path::new("/out/a.vcf.gz")),
            PathBuf::from("/out/a.vcf.gz.tbi")
        );
        assert_eq!(
            index_sibling(Path::new("/out/a.indels.recal")),
            PathBuf::from("/out/a.indels.recal.idx")
        );
    }

    #[test]
    fn test_layout_names_shards_distinctly() {
        let layout = ArtifactLayout::new("/out", "cohort");
        let filtered = layout.filtered(ShardIndex(2));
        let sites = layout.sites_only(ShardIndex(2));
        assert_ne!(filtered, sites);
        assert_eq!(
            filtered.primary,
            PathBuf::from("/out/cohort.2.variant_filtered.vcf.gz")
        );
        assert_eq!(
            layout.full_metrics().summary.primary,
            PathBuf::from("/out/cohort.variant_calling_summary_metrics")
        );
    }

    #[test]
    fn test_missing_files_reports_both_members() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact::vcf(dir.path().join("x.vcf.gz"));
        assert_eq!(artifact.missing_files().len(), 2);

        std::fs::write(&artifact.primary, b"").unwrap();
        assert_eq!(artifact.missing_files(), vec![dir.path().join("x.vcf.gz.tbi")]);
    }
}
