//! Test support for cohortflow: a simulated tool executor with failure
//! injection and site-count tracking, plus cohort and configuration fixtures.

pub mod executor;
pub mod fixtures;

pub use executor::{
    FailurePlan, InjectedFailure, InvocationRecord, LogEntry, Phase, SimulatedToolExecutor,
};
pub use fixtures::{
    SimulatedOrchestrator, SimulatedRunner, TEST_CONFIG, adjacent_intervals, sample_map,
    simulated_orchestrator, test_config,
};
