use std::time::Duration;

use cohortflow::{GatherBranch, ShardIndex, TaskKind};
use cohortflow_testkit::{
    FailurePlan, InjectedFailure, Phase, SimulatedToolExecutor, adjacent_intervals, sample_map,
    simulated_orchestrator, test_config,
};

#[tokio::test]
async fn test_indel_applied_before_snp_per_shard() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SimulatedToolExecutor::new();
    let (orchestrator, _) =
        simulated_orchestrator(test_config(dir.path()).unwrap(), executor.clone()).unwrap();

    let intervals = adjacent_intervals("chr1", 9, 100).unwrap();
    let outcome = orchestrator
        .run_with(&sample_map(200).unwrap(), &intervals)
        .await
        .unwrap();
    assert_eq!(outcome.plan.shards.len(), 3);

    for i in 0..3 {
        let shard = Some(ShardIndex(i));
        let indel_done = executor
            .position(TaskKind::ApplyIndelRecalibration, shard, Phase::Finished)
            .unwrap();
        let snp_start = executor
            .position(TaskKind::ApplySnpRecalibration, shard, Phase::Started)
            .unwrap();
        assert!(indel_done < snp_start, "shard {i}: SNP applied before INDEL");
    }

    // The SNP pass reads the INDEL-recalibrated VCF of the same shard.
    let indel = executor.records_of(TaskKind::ApplyIndelRecalibration);
    for record in executor.records_of(TaskKind::ApplySnpRecalibration) {
        let upstream = indel
            .iter()
            .find(|candidate| candidate.shard == record.shard)
            .unwrap();
        assert_eq!(record.inputs[0], upstream.outputs[0]);
    }
}

#[tokio::test]
async fn test_snp_training_overlaps_indel_work() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SimulatedToolExecutor::new()
        .with_latency(TaskKind::IndelsVariantRecalibrator, Duration::from_millis(20))
        .with_latency(
            TaskKind::SnpsVariantRecalibratorClassic,
            Duration::from_millis(200),
        );
    let (orchestrator, _) =
        simulated_orchestrator(test_config(dir.path()).unwrap(), executor.clone()).unwrap();

    let intervals = adjacent_intervals("chr1", 6, 100).unwrap();
    orchestrator
        .run_with(&sample_map(300).unwrap(), &intervals)
        .await
        .unwrap();

    let snp_start = executor
        .position(TaskKind::SnpsVariantRecalibratorClassic, None, Phase::Started)
        .unwrap();
    let indel_done = executor
        .position(TaskKind::IndelsVariantRecalibrator, None, Phase::Finished)
        .unwrap();
    let snp_done = executor
        .position(TaskKind::SnpsVariantRecalibratorClassic, None, Phase::Finished)
        .unwrap();

    // Both models train concurrently off the same sites-only VCF.
    assert!(snp_start < indel_done);
    // INDEL application does not wait for the SNP model.
    for i in 0..2 {
        let apply_indel = executor
            .position(
                TaskKind::ApplyIndelRecalibration,
                Some(ShardIndex(i)),
                Phase::Started,
            )
            .unwrap();
        assert!(apply_indel < snp_done, "shard {i} waited for SNP training");
    }
}

#[tokio::test]
async fn test_shard_metrics_start_without_waiting_for_other_shards() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path()).unwrap();
    config.retry.backoff_ms = 300;
    let executor = SimulatedToolExecutor::new().with_failures(FailurePlan::new().fail_attempts(
        TaskKind::ApplySnpRecalibration,
        Some(ShardIndex(1)),
        [1],
        InjectedFailure::Transient,
    ));
    let (orchestrator, _) = simulated_orchestrator(config, executor.clone()).unwrap();

    let intervals = adjacent_intervals("chr1", 6, 100).unwrap();
    let outcome = orchestrator
        .run_with(&sample_map(2_000).unwrap(), &intervals)
        .await
        .unwrap();
    assert_eq!(outcome.outputs.branch(), GatherBranch::NonSmall);
    assert_eq!(outcome.plan.shards.len(), 2);
    assert_eq!(executor.attempts_of(TaskKind::ApplySnpRecalibration), 3);

    let log = executor.log();
    let fast_metrics = executor
        .position(
            TaskKind::CollectMetricsSharded,
            Some(ShardIndex(0)),
            Phase::Started,
        )
        .unwrap();
    let slow_snp_done = log
        .iter()
        .rposition(|entry| {
            entry.kind == TaskKind::ApplySnpRecalibration
                && entry.shard == Some(ShardIndex(1))
                && entry.phase == Phase::Finished
        })
        .unwrap();
    assert!(
        fast_metrics < slow_snp_done,
        "shard 0 metrics waited for shard 1's recalibration"
    );

    // Accumulation still waits for every shard.
    let accumulate = executor
        .position(TaskKind::GatherMetrics, None, Phase::Started)
        .unwrap();
    assert!(slow_snp_done < accumulate);
}
