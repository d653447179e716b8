//! Benchmarks for run planning using criterion.
//!
//! - Chaining interval lists of increasing size with occasional gaps
//! - Building the task graph for both routing shapes
//! - A full simulated run of a small cohort

#![allow(missing_docs)]

use cohortflow::{
    CohortSizeRouter, GenomicInterval, IntervalPlanner, RoutingThresholds, TaskGraph,
};
use cohortflow_testkit::{
    SimulatedToolExecutor, adjacent_intervals, sample_map, simulated_orchestrator, test_config,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::Runtime;

/// Sorted, disjoint intervals; roughly one in ten is separated from its
/// predecessor by a gap.
fn gapped_intervals(count: usize) -> Vec<GenomicInterval> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut start = 1u64;
    let mut intervals = Vec::with_capacity(count);
    for _ in 0..count {
        if rng.random_bool(0.1) {
            start += rng.random_range(1..10_000);
        }
        let end = start + rng.random_range(500..5_000);
        intervals.push(GenomicInterval {
            chromosome: "chr1".to_string(),
            start,
            end,
        });
        start = end + 1;
    }
    intervals
}

fn bench_chain_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_planning");

    for count in [1_000usize, 10_000, 50_000] {
        let intervals = gapped_intervals(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &intervals, |b, intervals| {
            let planner = IntervalPlanner::new(3);
            b.iter(|| planner.plan(intervals));
        });
    }

    group.finish();
}

fn bench_graph_planning(c: &mut Criterion) {
    let router = CohortSizeRouter::new(RoutingThresholds::default());
    let mut group = c.benchmark_group("graph_planning");

    for samples in [500usize, 20_000] {
        let decision = router.route(samples);
        group.bench_with_input(BenchmarkId::new("shards_2000", samples), &decision, |b, decision| {
            b.iter(|| TaskGraph::plan(2_000, decision, false));
        });
    }

    group.finish();
}

fn bench_simulated_run(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create tokio runtime");
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let samples = sample_map(100).expect("sample map");
    let intervals = adjacent_intervals("chr1", 60, 1_000).expect("intervals");

    let mut group = c.benchmark_group("simulated_run");
    group.sample_size(20);

    group.bench_function("small_cohort_20_shards", |b| {
        b.to_async(&rt).iter(|| async {
            let config = test_config(dir.path()).expect("config");
            let (orchestrator, _) = simulated_orchestrator(config, SimulatedToolExecutor::new())
                .expect("orchestrator");
            orchestrator
                .run_with(&samples, &intervals)
                .await
                .expect("run should succeed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_chain_planning,
    bench_graph_planning,
    bench_simulated_run
);
criterion_main!(benches);
