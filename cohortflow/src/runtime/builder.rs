use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::budget::{Budget, InMemoryBudget};
use crate::events::TaskEventPublisher;
use crate::task::{RunId, TaskClass};

use super::resources::RunnerConfig;
use super::runner::{ShutdownToken, TaskRunner, ToolExecutor};

/// Builder for a [`TaskRunner`] with explicit dependencies.
///
/// ```ignore
/// let runner = TaskRunnerBuilder::new(config)
///     .with_executor(executor)
///     .with_budget(budget)
///     .with_events(events)
///     .build()?;
/// ```
pub struct TaskRunnerBuilder<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    config: RunnerConfig,
    executor: Option<Arc<E>>,
    budget: Option<Arc<B>>,
    events: Option<Arc<dyn TaskEventPublisher + 'static>>,
    run_id: Option<RunId>,
    shutdown: Option<ShutdownToken>,
}

impl<E, B> fmt::Debug for TaskRunnerBuilder<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TaskRunnerBuilder");
        debug.field("config", &self.config);
        debug.field("executor_set", &self.executor.is_some());
        debug.field("budget_set", &self.budget.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("run_id", &self.run_id);

        if self.executor.is_some() {
            debug.field("executor_type", &type_name::<E>());
        }
        if self.budget.is_some() {
            debug.field("budget_type", &type_name::<B>());
        }

        debug.finish()
    }
}

impl<E, B> TaskRunnerBuilder<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            executor: None,
            budget: None,
            events: None,
            run_id: None,
            shutdown: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<E>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_budget(mut self, budget: Arc<B>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn TaskEventPublisher + 'static>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the executor, budget or event publisher is missing.
    pub fn build(self) -> anyhow::Result<TaskRunner<E, B>> {
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor dependency missing"))?;
        let budget = self
            .budget
            .ok_or_else(|| anyhow::anyhow!("budget dependency missing"))?;
        let events = self
            .events
            .ok_or_else(|| anyhow::anyhow!("events dependency missing"))?;

        Ok(TaskRunner::new(
            self.config,
            executor,
            budget,
            events,
            self.run_id.unwrap_or_default(),
            self.shutdown.unwrap_or_default(),
        ))
    }
}

impl<E> TaskRunnerBuilder<E, InMemoryBudget<TaskClass>>
where
    E: ToolExecutor + 'static,
{
    /// Use an in-process budget sized from the runner configuration.
    pub fn with_in_memory_budget(self) -> Self {
        let budget = InMemoryBudget::new(self.config.budget_config());
        self.with_budget(Arc::new(budget))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::runtime::resources::ResourceProfile;
    use crate::runtime::runner::ExecStatus;
    use crate::task::ToolInvocation;
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl ToolExecutor for NoopExecutor {
        async fn execute(
            &self,
            invocation: &ToolInvocation,
            _profile: &ResourceProfile,
            _attempt: u32,
        ) -> ExecStatus {
            ExecStatus::Success {
                produced: invocation.outputs.clone(),
            }
        }
    }

    #[test]
    fn test_build_requires_dependencies() {
        let err = TaskRunnerBuilder::<NoopExecutor, InMemoryBudget<TaskClass>>::new(
            RunnerConfig::default(),
        )
        .with_executor(Arc::new(NoopExecutor))
        .build()
        .unwrap_err();
        assert!(err.to_string().contains("budget dependency missing"));
    }

    #[test]
    fn test_build_with_in_memory_budget() {
        let run_id = RunId::new();
        let runner = TaskRunnerBuilder::<NoopExecutor, InMemoryBudget<TaskClass>>::new(
            RunnerConfig::default().with_max_concurrent_tasks(3),
        )
        .with_executor(Arc::new(NoopExecutor))
        .with_in_memory_budget()
        .with_events(Arc::new(InProcEventBus::default()))
        .with_run_id(run_id)
        .build()
        .unwrap();

        assert_eq!(runner.run_id(), run_id);
        assert_eq!(runner.config().max_concurrent_tasks, 3);
        assert!(format!("{runner:?}").contains("NoopExecutor"));
    }
}
