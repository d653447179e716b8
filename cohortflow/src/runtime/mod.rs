/// Builder for task runners.
pub mod builder;
/// Child-process tool executor.
pub mod command;
/// Per-class resource sizing and runner settings.
pub mod resources;
/// Retrying task runner, executor trait and shutdown token.
pub mod runner;

pub use builder::TaskRunnerBuilder;
pub use command::CommandToolExecutor;
pub use resources::{ResourceProfile, RunnerConfig};
pub use runner::{ExecStatus, ShutdownToken, TaskRunner, ToolExecutor, missing_outputs};
