use async_trait::async_trait;
use cohortflow::runtime::{ExecStatus, ResourceProfile, ToolExecutor};
use cohortflow::{Artifact, ShardIndex, TaskId, TaskKind, ToolInvocation};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Failure the simulator can inject into an attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InjectedFailure {
    Transient,
    Preempted,
    Permanent,
    /// Exit cleanly but produce none of the declared outputs.
    MissingOutputs,
}

#[derive(Clone, Debug)]
struct FailureRule {
    kind: TaskKind,
    shard: Option<ShardIndex>,
    /// `None` matches every attempt.
    attempts: Option<Vec<u32>>,
    failure: InjectedFailure,
}

/// Which attempts of which tasks fail, and how.
#[derive(Clone, Debug, Default)]
pub struct FailurePlan {
    rules: Vec<FailureRule>,
}

impl FailurePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the listed attempts (1-based) of `kind`, optionally on one shard only.
    pub fn fail_attempts(
        mut self,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        attempts: impl IntoIterator<Item = u32>,
        failure: InjectedFailure,
    ) -> Self {
        self.rules.push(FailureRule {
            kind,
            shard,
            attempts: Some(attempts.into_iter().collect()),
            failure,
        });
        self
    }

    /// Fail every attempt of `kind`, optionally on one shard only.
    pub fn fail_always(
        mut self,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        failure: InjectedFailure,
    ) -> Self {
        self.rules.push(FailureRule {
            kind,
            shard,
            attempts: None,
            failure,
        });
        self
    }

    pub fn lookup(
        &self,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        attempt: u32,
    ) -> Option<InjectedFailure> {
        self.rules
            .iter()
            .find(|rule| {
                rule.kind == kind
                    && (rule.shard.is_none() || rule.shard == shard)
                    && rule
                        .attempts
                        .as_ref()
                        .is_none_or(|attempts| attempts.contains(&attempt))
            })
            .map(|rule| rule.failure)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Started,
    Finished,
}

/// One attempt as the simulator saw it.
#[derive(Clone, Debug)]
pub struct InvocationRecord {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub shard: Option<ShardIndex>,
    pub attempt: u32,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<Artifact>,
    pub injected: Option<InjectedFailure>,
}

/// Ordered start/finish log entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub kind: TaskKind,
    pub shard: Option<ShardIndex>,
    pub attempt: u32,
    pub phase: Phase,
}

#[derive(Default)]
struct SimState {
    records: Vec<InvocationRecord>,
    log: Vec<LogEntry>,
    sites: HashMap<PathBuf, u64>,
}

/// In-memory executor: writes nothing, reports declared outputs as produced,
/// and tracks how many variant sites each VCF-like artifact holds.
///
/// Genotyping seeds a shard's site count; filtering, recalibration
/// application and sample selection carry the count of their first input
/// through unchanged; gathers sum their inputs.
#[derive(Clone)]
pub struct SimulatedToolExecutor {
    plan: Arc<FailurePlan>,
    latencies: Arc<HashMap<TaskKind, Duration>>,
    sites_per_shard: u64,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedToolExecutor {
    pub fn new() -> Self {
        Self {
            plan: Arc::new(FailurePlan::default()),
            latencies: Arc::new(HashMap::new()),
            sites_per_shard: 1_000,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn with_failures(mut self, plan: FailurePlan) -> Self {
        self.plan = Arc::new(plan);
        self
    }

    /// Delay every attempt of `kind` by `latency`.
    pub fn with_latency(mut self, kind: TaskKind, latency: Duration) -> Self {
        Arc::make_mut(&mut self.latencies).insert(kind, latency);
        self
    }

    pub fn with_sites_per_shard(mut self, sites: u64) -> Self {
        self.sites_per_shard = sites;
        self
    }

    pub fn records(&self) -> Vec<InvocationRecord> {
        self.state.lock().records.clone()
    }

    pub fn records_of(&self, kind: TaskKind) -> Vec<InvocationRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of attempts started for `kind`.
    pub fn attempts_of(&self, kind: TaskKind) -> usize {
        self.state
            .lock()
            .records
            .iter()
            .filter(|record| record.kind == kind)
            .count()
    }

    /// Number of distinct tasks of `kind` that were attempted at least once.
    pub fn tasks_of(&self, kind: TaskKind) -> usize {
        let state = self.state.lock();
        let mut ids: Vec<TaskId> = state
            .records
            .iter()
            .filter(|record| record.kind == kind)
            .map(|record| record.task_id)
            .collect();
        ids.sort_by_key(|id| id.0);
        ids.dedup();
        ids.len()
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.state.lock().log.clone()
    }

    /// Index in the log of the first entry matching `kind`, `shard` and `phase`.
    pub fn position(&self, kind: TaskKind, shard: Option<ShardIndex>, phase: Phase) -> Option<usize> {
        self.state
            .lock()
            .log
            .iter()
            .position(|entry| entry.kind == kind && entry.shard == shard && entry.phase == phase)
    }

    pub fn site_count(&self, path: &Path) -> Option<u64> {
        self.state.lock().sites.get(path).copied()
    }

    fn record_sites(&self, state: &mut SimState, invocation: &ToolInvocation) {
        let input_sites = |artifact: &Artifact| state.sites.get(&artifact.primary).copied();
        let carried = match invocation.kind {
            TaskKind::GenotypeGvcfs => {
                let shard = invocation.shard.map(|s| s.0 as u64).unwrap_or_default();
                Some(self.sites_per_shard + shard)
            }
            TaskKind::HardFilterAndMakeSitesOnly
            | TaskKind::ApplyIndelRecalibration
            | TaskKind::ApplySnpRecalibration
            | TaskKind::SelectSamples => invocation.inputs.first().and_then(input_sites),
            TaskKind::SitesOnlyGather | TaskKind::FinalGatherVcf => invocation
                .inputs
                .iter()
                .map(input_sites)
                .sum::<Option<u64>>(),
            _ => None,
        };

        if let Some(count) = carried {
            let outputs: Vec<PathBuf> = invocation
                .outputs
                .iter()
                .filter(|artifact| artifact.index.is_some())
                .map(|artifact| artifact.primary.clone())
                .collect();
            for path in outputs {
                state.sites.insert(path, count);
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for SimulatedToolExecutor {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        _profile: &ResourceProfile,
        attempt: u32,
    ) -> ExecStatus {
        let injected = self.plan.lookup(invocation.kind, invocation.shard, attempt);
        {
            let mut state = self.state.lock();
            state.records.push(InvocationRecord {
                task_id: invocation.id,
                kind: invocation.kind,
                shard: invocation.shard,
                attempt,
                inputs: invocation.inputs.clone(),
                outputs: invocation.outputs.clone(),
                injected,
            });
            state.log.push(LogEntry {
                kind: invocation.kind,
                shard: invocation.shard,
                attempt,
                phase: Phase::Started,
            });
        }

        if let Some(latency) = self.latencies.get(&invocation.kind) {
            tokio::time::sleep(*latency).await;
        } else {
            tokio::task::yield_now().await;
        }

        let mut state = self.state.lock();
        state.log.push(LogEntry {
            kind: invocation.kind,
            shard: invocation.shard,
            attempt,
            phase: Phase::Finished,
        });

        let label = invocation.label();
        match injected {
            Some(InjectedFailure::Transient) => ExecStatus::TransientFailure {
                error: format!("{label}: simulated copy failure"),
            },
            Some(InjectedFailure::Preempted) => ExecStatus::Preempted {
                error: format!("{label}: simulated preemption"),
            },
            Some(InjectedFailure::Permanent) => ExecStatus::PermanentFailure {
                error: format!("{label}: simulated malformed input"),
            },
            Some(InjectedFailure::MissingOutputs) => ExecStatus::Success {
                produced: Vec::new(),
            },
            None => {
                self.record_sites(&mut state, invocation);
                ExecStatus::Success {
                    produced: invocation.outputs.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_plan_matches_shard_and_attempt() {
        let plan = FailurePlan::new()
            .fail_attempts(
                TaskKind::GatherTranches,
                None,
                1..=4,
                InjectedFailure::Transient,
            )
            .fail_always(
                TaskKind::GenotypeGvcfs,
                Some(ShardIndex(1)),
                InjectedFailure::Permanent,
            );

        assert_eq!(
            plan.lookup(TaskKind::GatherTranches, None, 4),
            Some(InjectedFailure::Transient)
        );
        assert_eq!(plan.lookup(TaskKind::GatherTranches, None, 5), None);
        assert_eq!(
            plan.lookup(TaskKind::GenotypeGvcfs, Some(ShardIndex(1)), 9),
            Some(InjectedFailure::Permanent)
        );
        assert_eq!(plan.lookup(TaskKind::GenotypeGvcfs, Some(ShardIndex(0)), 1), None);
    }

    #[tokio::test]
    async fn test_sites_carried_through_apply() {
        let executor = SimulatedToolExecutor::new().with_sites_per_shard(50);
        let genotyped = Artifact::vcf("/out/c.2.vcf.gz");
        let applied = Artifact::vcf("/out/c.filtered.2.vcf.gz");

        executor
            .execute(
                &ToolInvocation::new(TaskKind::GenotypeGvcfs, "gatk")
                    .for_shard(ShardIndex(2))
                    .output(genotyped.clone()),
                &ResourceProfile::default(),
                1,
            )
            .await;
        executor
            .execute(
                &ToolInvocation::new(TaskKind::ApplySnpRecalibration, "gatk")
                    .for_shard(ShardIndex(2))
                    .input(genotyped.clone())
                    .input(Artifact::vcf("/out/c.snps.recal"))
                    .output(applied.clone()),
                &ResourceProfile::default(),
                1,
            )
            .await;

        assert_eq!(executor.site_count(&genotyped.primary), Some(52));
        assert_eq!(executor.site_count(&applied.primary), Some(52));
    }
}
