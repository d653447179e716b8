//! `cohortflow` command-line entry point.
//!
//! - `cohortflow plan --config run.toml` prints the chain plan and routing decision.
//! - `cohortflow run --config run.toml` executes the run with local child processes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cohortflow::{
    Budget, CohortSampleMap, CommandToolExecutor, GenomicInterval, InMemoryBudget,
    InProcEventBus, JointCallingOrchestrator, OrchestratorError, PipelineConfig, TaskClass,
    TaskRunnerBuilder, ToolExecutor, read_interval_list,
};

#[derive(Parser)]
#[command(name = "cohortflow")]
#[command(about = "Scatter/gather orchestration for joint variant calling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan shards and routing without running anything
    Plan {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Interval list to plan instead of the configured one
        #[arg(short, long)]
        intervals: Option<PathBuf>,
    },

    /// Execute the run
    Run {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Skip checking that selected outputs exist on disk
        #[arg(long)]
        no_output_check: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Plan { config, intervals } => plan(config, intervals),
        Commands::Run {
            config,
            no_output_check,
        } => run(config, !no_output_check).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn orchestrator(
    config: PipelineConfig,
) -> Result<JointCallingOrchestrator<CommandToolExecutor, InMemoryBudget<TaskClass>>> {
    let runner = TaskRunnerBuilder::<CommandToolExecutor, InMemoryBudget<TaskClass>>::new(
        config.runner_config(),
    )
    .with_executor(Arc::new(CommandToolExecutor::new()))
    .with_in_memory_budget()
    .with_events(Arc::new(InProcEventBus::new(config.runner.event_capacity)))
    .build()?;
    Ok(JointCallingOrchestrator::new(config, runner))
}

fn plan(config_path: PathBuf, intervals: Option<PathBuf>) -> Result<()> {
    let config = load_config(&config_path)?;
    let orchestrator = orchestrator(config)?;
    let (samples, intervals) = plan_inputs(&orchestrator, intervals.as_deref())?;

    let plan = orchestrator.plan(&samples, &intervals)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

/// The configured interval list is only read when no override is given.
fn plan_inputs<E, B>(
    orchestrator: &JointCallingOrchestrator<E, B>,
    intervals: Option<&Path>,
) -> Result<(CohortSampleMap, Vec<GenomicInterval>)>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    match intervals {
        Some(path) => Ok((orchestrator.load_samples()?, read_interval_list(path)?)),
        None => Ok(orchestrator.load_inputs()?),
    }
}

async fn run(config_path: PathBuf, check_outputs: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate().context("invalid run configuration")?;
    let orchestrator = orchestrator(config)?.with_output_check(check_outputs);

    let shutdown = orchestrator.runner().shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            shutdown.cancel();
        }
    });

    match orchestrator.run().await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(OrchestratorError::Incomplete {
            branch,
            failures,
            report,
        }) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            for failure in &failures {
                tracing::error!(node = %failure.node, "{}", failure.error);
            }
            anyhow::bail!("{branch} outputs did not materialize ({} failed task(s))", failures.len())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator_in(
        dir: &Path,
    ) -> JointCallingOrchestrator<CommandToolExecutor, InMemoryBudget<TaskClass>> {
        let config = cohortflow_testkit::test_config(dir).unwrap();
        std::fs::write(&config.cohort.sample_map, "s1\tgvcfs/s1.g.vcf.gz\n").unwrap();
        orchestrator(config).unwrap()
    }

    #[test]
    fn test_interval_override_skips_configured_list() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let override_list = dir.path().join("override.interval_list");
        std::fs::write(&override_list, "chr1:1-100\nchr1:101-200\n").unwrap();

        // The configured interval list was never written.
        assert!(!orchestrator.config().cohort.intervals.exists());
        let (samples, intervals) = plan_inputs(&orchestrator, Some(&override_list)).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(intervals.len(), 2);

        let plan = orchestrator.plan(&samples, &intervals).unwrap();
        assert_eq!(plan.num_samples, 1);
        assert_eq!(plan.num_intervals, 2);
    }

    #[test]
    fn test_configured_list_required_without_override() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());

        assert!(plan_inputs(&orchestrator, None).is_err());
    }
}
