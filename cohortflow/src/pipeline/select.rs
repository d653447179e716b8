use std::collections::BTreeSet;

use serde::Serialize;

use crate::artifact::{Artifact, MetricsPair};
use crate::error::SelectionError;
use crate::router::GatherBranch;

use super::gather::GatherOutcome;

/// The canonical result set of a complete run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "branch", rename_all = "snake_case")]
pub enum CallsetOutputs {
    Merged {
        vcf: Artifact,
        #[serde(skip_serializing_if = "Option::is_none")]
        selected: Option<Artifact>,
        metrics: MetricsPair,
    },
    /// Per-shard VCFs in genomic order.
    Sharded {
        vcfs: Vec<Artifact>,
        metrics: MetricsPair,
    },
}

impl CallsetOutputs {
    pub fn branch(&self) -> GatherBranch {
        match self {
            CallsetOutputs::Merged { .. } => GatherBranch::Small,
            CallsetOutputs::Sharded { .. } => GatherBranch::NonSmall,
        }
    }

    pub fn metrics(&self) -> &MetricsPair {
        match self {
            CallsetOutputs::Merged { metrics, .. } | CallsetOutputs::Sharded { metrics, .. } => {
                metrics
            }
        }
    }

    /// Every artifact in the result set.
    pub fn artifacts(&self) -> Vec<&Artifact> {
        let mut artifacts = Vec::new();
        match self {
            CallsetOutputs::Merged { vcf, selected, .. } => {
                artifacts.push(vcf);
                artifacts.extend(selected.as_ref());
            }
            CallsetOutputs::Sharded { vcfs, .. } => artifacts.extend(vcfs),
        }
        artifacts.extend(self.metrics().artifacts());
        artifacts
    }
}

/// Turns the one gather outcome of a run into its result set.
///
/// Selection never returns an empty or half-filled result: an outcome from
/// the wrong branch, a missing outcome or an incomplete shard list is an
/// error naming the routed branch.
#[derive(Clone, Debug)]
pub struct OutputSelector {
    expected: GatherBranch,
    shard_count: usize,
    check_files: bool,
}

impl OutputSelector {
    pub fn new(expected: GatherBranch, shard_count: usize) -> Self {
        Self {
            expected,
            shard_count,
            check_files: false,
        }
    }

    /// Also require every selected artifact to exist on the local filesystem.
    pub fn with_file_check(mut self, enabled: bool) -> Self {
        self.check_files = enabled;
        self
    }

    pub fn select(&self, outcome: Option<GatherOutcome>) -> Result<CallsetOutputs, SelectionError> {
        let Some(outcome) = outcome else {
            return Err(self.not_ready("no gather branch produced outputs"));
        };
        if outcome.branch() != self.expected {
            return Err(SelectionError::BranchMismatch {
                expected: self.expected,
                found: outcome.branch(),
            });
        }

        let outputs = match outcome {
            GatherOutcome::Small {
                merged,
                selected,
                metrics,
            } => CallsetOutputs::Merged {
                vcf: merged,
                selected,
                metrics,
            },
            GatherOutcome::NonSmall { shards, metrics } => {
                let indices: BTreeSet<usize> = shards.iter().map(|shard| shard.index.0).collect();
                if shards.len() != self.shard_count
                    || indices.len() != shards.len()
                    || indices.iter().copied().ne(0..self.shard_count)
                {
                    return Err(self.not_ready(format!(
                        "expected {} shard VCFs, got {} with indices {:?}",
                        self.shard_count,
                        shards.len(),
                        indices
                    )));
                }
                let mut shards = shards;
                shards.sort_by_key(|shard| shard.index);
                CallsetOutputs::Sharded {
                    vcfs: shards.into_iter().map(|shard| shard.vcf).collect(),
                    metrics,
                }
            }
        };

        if self.check_files {
            let missing: Vec<_> = outputs
                .artifacts()
                .into_iter()
                .flat_map(Artifact::missing_files)
                .collect();
            if !missing.is_empty() {
                return Err(self.not_ready(format!("missing output files {missing:?}")));
            }
        }
        Ok(outputs)
    }

    fn not_ready(&self, reason: impl Into<String>) -> SelectionError {
        SelectionError::NotReady {
            branch: self.expected,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RecalibratedShard;
    use crate::task::ShardIndex;

    fn metrics() -> MetricsPair {
        MetricsPair::from_prefix(std::path::Path::new("/out/c"))
    }

    fn shard(i: usize) -> RecalibratedShard {
        RecalibratedShard {
            index: ShardIndex(i),
            vcf: Artifact::vcf(format!("/out/c.filtered.{i}.vcf.gz")),
        }
    }

    #[test]
    fn test_select_small_branch() {
        let outcome = GatherOutcome::Small {
            merged: Artifact::vcf("/out/c.vcf.gz"),
            selected: None,
            metrics: metrics(),
        };
        let outputs = OutputSelector::new(GatherBranch::Small, 3)
            .select(Some(outcome))
            .unwrap();

        assert_eq!(outputs.branch(), GatherBranch::Small);
        assert_eq!(outputs.artifacts().len(), 3);
    }

    #[test]
    fn test_missing_outcome_is_not_ready() {
        let err = OutputSelector::new(GatherBranch::NonSmall, 2)
            .select(None)
            .unwrap_err();
        assert!(matches!(
            err,
            SelectionError::NotReady {
                branch: GatherBranch::NonSmall,
                ..
            }
        ));
    }

    #[test]
    fn test_branch_mismatch() {
        let outcome = GatherOutcome::NonSmall {
            shards: vec![shard(0)],
            metrics: metrics(),
        };
        let err = OutputSelector::new(GatherBranch::Small, 1)
            .select(Some(outcome))
            .unwrap_err();
        assert!(matches!(
            err,
            SelectionError::BranchMismatch {
                expected: GatherBranch::Small,
                found: GatherBranch::NonSmall
            }
        ));
    }

    #[test]
    fn test_sharded_outputs_sorted_and_complete() {
        let outcome = GatherOutcome::NonSmall {
            shards: vec![shard(1), shard(0)],
            metrics: metrics(),
        };
        let outputs = OutputSelector::new(GatherBranch::NonSmall, 2)
            .select(Some(outcome))
            .unwrap();
        match outputs {
            CallsetOutputs::Sharded { vcfs, .. } => {
                assert_eq!(vcfs, vec![shard(0).vcf, shard(1).vcf]);
            }
            other => panic!("unexpected outputs: {other:?}"),
        }

        let partial = GatherOutcome::NonSmall {
            shards: vec![shard(0)],
            metrics: metrics(),
        };
        assert!(
            OutputSelector::new(GatherBranch::NonSmall, 2)
                .select(Some(partial))
                .is_err()
        );
    }

    #[test]
    fn test_file_check_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let merged = Artifact::vcf(dir.path().join("c.vcf.gz"));
        let outcome = GatherOutcome::Small {
            merged,
            selected: None,
            metrics: MetricsPair::from_prefix(&dir.path().join("c")),
        };
        let err = OutputSelector::new(GatherBranch::Small, 1)
            .with_file_check(true)
            .select(Some(outcome))
            .unwrap_err();
        assert!(err.to_string().contains("missing output files"));
    }
}
