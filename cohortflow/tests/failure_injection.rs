use cohortflow::{
    GatherBranch, NodeKey, NodeStatus, OrchestratorError, ShardIndex, TaskError,
    TaskEventPayload, TaskKind,
};
use cohortflow_testkit::{
    FailurePlan, InjectedFailure, SimulatedToolExecutor, adjacent_intervals, sample_map,
    simulated_orchestrator, test_config,
};

#[tokio::test]
async fn test_tranche_gather_recovers_within_transient_budget() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SimulatedToolExecutor::new().with_failures(FailurePlan::new().fail_attempts(
        TaskKind::GatherTranches,
        None,
        1..=4,
        InjectedFailure::Transient,
    ));
    let (orchestrator, _) =
        simulated_orchestrator(test_config(dir.path()).unwrap(), executor.clone()).unwrap();

    let intervals = adjacent_intervals("chr1", 6, 100).unwrap();
    let outcome = orchestrator
        .run_with(&sample_map(12_000).unwrap(), &intervals)
        .await
        .unwrap();

    assert_eq!(outcome.outputs.branch(), GatherBranch::NonSmall);
    assert_eq!(executor.attempts_of(TaskKind::GatherTranches), 5);
    assert_eq!(executor.tasks_of(TaskKind::GatherTranches), 1);
    assert!(outcome.report.is_clean());
}

#[tokio::test]
async fn test_exhausted_tranche_gather_aborts_only_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SimulatedToolExecutor::new().with_failures(FailurePlan::new().fail_attempts(
        TaskKind::GatherTranches,
        None,
        1..=5,
        InjectedFailure::Transient,
    ));
    let (orchestrator, events) =
        simulated_orchestrator(test_config(dir.path()).unwrap(), executor.clone()).unwrap();
    let mut rx = events.subscribe_events();

    let intervals = adjacent_intervals("chr1", 6, 100).unwrap();
    let err = orchestrator
        .run_with(&sample_map(12_000).unwrap(), &intervals)
        .await
        .unwrap_err();

    let OrchestratorError::Incomplete {
        branch,
        failures,
        report,
    } = err
    else {
        panic!("expected an incomplete run");
    };
    assert_eq!(branch, GatherBranch::NonSmall);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].node, NodeKey::TrancheGather);
    assert!(matches!(
        failures[0].error,
        TaskError::TransientBudgetExhausted { attempts: 5, .. }
    ));
    assert_eq!(executor.attempts_of(TaskKind::GatherTranches), 5);

    for i in 0..2 {
        let shard = ShardIndex(i);
        // Siblings on the INDEL side and the per-shard scoring finished.
        assert_eq!(
            report.status_of(NodeKey::SnpScattered(shard)),
            Some(NodeStatus::Succeeded)
        );
        assert_eq!(
            report.status_of(NodeKey::ApplyIndel(shard)),
            Some(NodeStatus::Succeeded)
        );
        assert_eq!(
            report.status_of(NodeKey::ApplySnp(shard)),
            Some(NodeStatus::Aborted)
        );
        assert_eq!(
            report.status_of(NodeKey::MetricsShard(shard)),
            Some(NodeStatus::Aborted)
        );
    }
    assert_eq!(
        report.status_of(NodeKey::MetricsGather),
        Some(NodeStatus::Aborted)
    );
    assert_eq!(executor.attempts_of(TaskKind::ApplySnpRecalibration), 0);
    assert_eq!(executor.attempts_of(TaskKind::GatherMetrics), 0);

    let mut aborted = 0;
    while let Ok(event) = rx.try_recv() {
        if let TaskEventPayload::Aborted { cause, .. } = event.payload {
            assert_eq!(cause, NodeKey::TrancheGather);
            aborted += 1;
        }
    }
    assert_eq!(aborted, report.aborted);
}

#[tokio::test]
async fn test_permanent_shard_failure_spares_sibling_shard() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SimulatedToolExecutor::new().with_failures(FailurePlan::new().fail_always(
        TaskKind::GenotypeGvcfs,
        Some(ShardIndex(1)),
        InjectedFailure::Permanent,
    ));
    let (orchestrator, _) =
        simulated_orchestrator(test_config(dir.path()).unwrap(), executor.clone()).unwrap();

    let intervals = adjacent_intervals("chr1", 6, 100).unwrap();
    let err = orchestrator
        .run_with(&sample_map(500).unwrap(), &intervals)
        .await
        .unwrap_err();

    let OrchestratorError::Incomplete {
        branch, report, ..
    } = err
    else {
        panic!("expected an incomplete run");
    };
    assert_eq!(branch, GatherBranch::Small);
    assert_eq!(report.failed, 1);
    assert_eq!(
        report.status_of(NodeKey::Genotype(ShardIndex(1))),
        Some(NodeStatus::Failed)
    );
    assert_eq!(
        report.status_of(NodeKey::HardFilter(ShardIndex(1))),
        Some(NodeStatus::Aborted)
    );
    assert_eq!(
        report.status_of(NodeKey::HardFilter(ShardIndex(0))),
        Some(NodeStatus::Succeeded)
    );
    assert_eq!(
        report.status_of(NodeKey::SitesOnlyGather),
        Some(NodeStatus::Aborted)
    );
    assert_eq!(
        report.status_of(NodeKey::FinalGather),
        Some(NodeStatus::Aborted)
    );

    // Permanent failures are not retried.
    assert_eq!(executor.attempts_of(TaskKind::GenotypeGvcfs), 2);
    assert_eq!(executor.attempts_of(TaskKind::SitesOnlyGather), 0);
    assert_eq!(executor.attempts_of(TaskKind::IndelsVariantRecalibrator), 0);
}

#[tokio::test]
async fn test_success_without_outputs_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SimulatedToolExecutor::new().with_failures(FailurePlan::new().fail_always(
        TaskKind::IndelsVariantRecalibrator,
        None,
        InjectedFailure::MissingOutputs,
    ));
    let (orchestrator, _) =
        simulated_orchestrator(test_config(dir.path()).unwrap(), executor.clone()).unwrap();

    let intervals = adjacent_intervals("chr1", 3, 100).unwrap();
    let err = orchestrator
        .run_with(&sample_map(50).unwrap(), &intervals)
        .await
        .unwrap_err();

    let OrchestratorError::Incomplete {
        failures, report, ..
    } = err
    else {
        panic!("expected an incomplete run");
    };
    assert_eq!(failures[0].node, NodeKey::IndelModel);
    assert!(matches!(failures[0].error, TaskError::MissingOutputs { .. }));
    // The SNP model trains independently of the INDEL model.
    assert_eq!(
        report.status_of(NodeKey::SnpClassic),
        Some(NodeStatus::Succeeded)
    );
    assert_eq!(executor.attempts_of(TaskKind::ApplyIndelRecalibration), 0);
    assert_eq!(executor.attempts_of(TaskKind::ApplySnpRecalibration), 0);
}

#[tokio::test]
async fn test_preempted_attempt_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SimulatedToolExecutor::new().with_failures(FailurePlan::new().fail_attempts(
        TaskKind::HardFilterAndMakeSitesOnly,
        Some(ShardIndex(0)),
        [1, 2],
        InjectedFailure::Preempted,
    ));
    let (orchestrator, _) =
        simulated_orchestrator(test_config(dir.path()).unwrap(), executor.clone()).unwrap();

    let intervals = adjacent_intervals("chr1", 6, 100).unwrap();
    let outcome = orchestrator
        .run_with(&sample_map(50).unwrap(), &intervals)
        .await
        .unwrap();

    assert!(outcome.report.is_clean());
    let attempts: Vec<u32> = executor
        .records_of(TaskKind::HardFilterAndMakeSitesOnly)
        .iter()
        .filter(|record| record.shard == Some(ShardIndex(0)))
        .map(|record| record.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}
