use std::any::type_name;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::artifact::Artifact;
use crate::budget::Budget;
use crate::error::TaskError;
use crate::events::{RetryReason, TaskEvent, TaskEventPayload, TaskEventPublisher};
use crate::retry::{AttemptLedger, RetryDecision};
use crate::task::{RunId, TaskClass, ToolInvocation};
use crate::telemetry::{
    instrument_task, record_task_completed, record_task_end, record_task_retry,
    record_task_start, set_inflight_tasks,
};

use super::resources::{ResourceProfile, RunnerConfig};

/// Token for cancelling a run from outside.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one attempt of a tool invocation.
#[derive(Clone, Debug)]
pub enum ExecStatus {
    /// The tool exited cleanly. `produced` lists what it actually wrote.
    Success { produced: Vec<Artifact> },
    /// Short-lived failure such as a failed remote copy.
    TransientFailure { error: String },
    /// The compute was reclaimed mid-task.
    Preempted { error: String },
    PermanentFailure { error: String },
}

/// Runs one attempt of a tool invocation.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        profile: &ResourceProfile,
        attempt: u32,
    ) -> ExecStatus;
}

/// Declared output files that are absent from `produced`.
pub fn missing_outputs(declared: &[Artifact], produced: &[Artifact]) -> Vec<PathBuf> {
    let produced: HashSet<&std::path::Path> =
        produced.iter().flat_map(Artifact::files).collect();
    declared
        .iter()
        .flat_map(Artifact::files)
        .filter(|path| !produced.contains(path))
        .map(|path| path.to_path_buf())
        .collect()
}

/// Executes tool invocations under the compute budget and both retry budgets.
pub struct TaskRunner<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    config: RunnerConfig,
    executor: Arc<E>,
    budget: Arc<B>,
    events: Arc<dyn TaskEventPublisher + 'static>,
    run_id: RunId,
    shutdown: ShutdownToken,
}

impl<E, B> fmt::Debug for TaskRunner<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("executor_type", &type_name::<E>())
            .field("budget_type", &type_name::<B>())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<E, B> TaskRunner<E, B>
where
    E: ToolExecutor + 'static,
    B: Budget<TaskClass> + 'static,
{
    pub fn new(
        config: RunnerConfig,
        executor: Arc<E>,
        budget: Arc<B>,
        events: Arc<dyn TaskEventPublisher + 'static>,
        run_id: RunId,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            config,
            executor,
            budget,
            events,
            run_id,
            shutdown,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn executor(&self) -> Arc<E> {
        Arc::clone(&self.executor)
    }

    pub fn budget(&self) -> Arc<B> {
        Arc::clone(&self.budget)
    }

    pub fn events(&self) -> Arc<dyn TaskEventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Publish an event, logging instead of failing if the bus rejects it.
    pub async fn publish(&self, payload: TaskEventPayload) {
        if let Err(err) = self.events.publish(TaskEvent::new(self.run_id, payload)).await {
            tracing::error!("publish task event failed: {err}");
        }
    }

    /// Run `invocation` to a terminal state.
    ///
    /// On success the declared outputs are returned. Transient failures and
    /// preemptions are retried against their own budgets; anything else is
    /// fatal for the task.
    pub async fn run(&self, invocation: &ToolInvocation) -> Result<Vec<Artifact>, TaskError> {
        let label = invocation.label();
        let kind = invocation.kind.as_str();
        let timing = record_task_start(&label);

        let result = instrument_task(
            invocation.id.to_string(),
            kind,
            self.attempt_loop(invocation, &label),
        )
        .await;

        let status = match &result {
            Ok(_) => "succeeded",
            Err(TaskError::Cancelled { .. }) => "cancelled",
            Err(_) => "failed",
        };
        record_task_end(timing, kind, status);
        record_task_completed(&label, kind, status);

        if let Err(error) = &result {
            self.publish(TaskEventPayload::Failed {
                task_id: invocation.id,
                kind: invocation.kind,
                shard: invocation.shard,
                error: error.clone(),
            })
            .await;
        }
        result
    }

    async fn attempt_loop(
        &self,
        invocation: &ToolInvocation,
        label: &str,
    ) -> Result<Vec<Artifact>, TaskError> {
        let class = invocation.class();
        let profile = self.config.profile(class);
        let mut ledger = AttemptLedger::new();

        loop {
            if self.shutdown.is_cancelled() {
                return Err(TaskError::Cancelled {
                    task: label.to_string(),
                });
            }

            let attempt = ledger.begin_attempt();
            let token = self
                .budget
                .acquire(class, invocation.id)
                .await
                .map_err(|err| TaskError::Budget {
                    task: label.to_string(),
                    message: err.to_string(),
                })?;
            self.report_inflight(class).await;

            tracing::debug!(task = %label, attempt, command = %invocation.command_line(), "starting attempt");
            self.publish(TaskEventPayload::Started {
                task_id: invocation.id,
                kind: invocation.kind,
                shard: invocation.shard,
                attempt,
            })
            .await;

            let status = tokio::select! {
                status = self.executor.execute(invocation, &profile, attempt) => Some(status),
                _ = self.shutdown.cancelled() => None,
            };

            if let Err(err) = self.budget.release(token).await {
                tracing::error!("budget release error: {err}");
            }
            self.report_inflight(class).await;

            let Some(status) = status else {
                return Err(TaskError::Cancelled {
                    task: label.to_string(),
                });
            };

            let (decision, reason, error) = match status {
                ExecStatus::Success { produced } => {
                    let missing = missing_outputs(&invocation.outputs, &produced);
                    if !missing.is_empty() {
                        return Err(TaskError::MissingOutputs {
                            task: label.to_string(),
                            missing,
                        });
                    }
                    self.publish(TaskEventPayload::Completed {
                        task_id: invocation.id,
                        kind: invocation.kind,
                        shard: invocation.shard,
                        attempts: attempt,
                    })
                    .await;
                    return Ok(invocation.outputs.clone());
                }
                ExecStatus::TransientFailure { error } => (
                    ledger.record_transient(&self.config.transient),
                    RetryReason::Transient,
                    error,
                ),
                ExecStatus::Preempted { error } => (
                    ledger.record_preemption(profile.max_retries),
                    RetryReason::Preempted,
                    error,
                ),
                ExecStatus::PermanentFailure { error } => {
                    return Err(TaskError::Permanent {
                        task: label.to_string(),
                        message: error,
                    });
                }
            };

            match decision {
                RetryDecision::Retry { delay } => {
                    record_task_retry(label, invocation.kind.as_str(), reason.as_str(), attempt);
                    tracing::debug!(task = %label, error = %error, "attempt failed");
                    self.publish(TaskEventPayload::Retrying {
                        task_id: invocation.id,
                        kind: invocation.kind,
                        shard: invocation.shard,
                        attempt,
                        reason,
                        delay_ms: delay.as_millis() as u64,
                    })
                    .await;
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.shutdown.cancelled() => {}
                        }
                    }
                }
                RetryDecision::Exhausted => {
                    return Err(match reason {
                        RetryReason::Transient => TaskError::TransientBudgetExhausted {
                            task: label.to_string(),
                            attempts: ledger.transient_failures,
                            last_error: error,
                        },
                        RetryReason::Preempted => TaskError::PreemptionBudgetExhausted {
                            task: label.to_string(),
                            preemptions: ledger.preemptions,
                            max_retries: profile.max_retries,
                        },
                    });
                }
            }
        }
    }

    async fn report_inflight(&self, class: TaskClass) {
        if let Ok((inflight, _)) = self.budget.utilization(class).await {
            set_inflight_tasks(class.as_str(), inflight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, InMemoryBudget};
    use crate::events::InProcEventBus;
    use crate::retry::TransientRetryPolicy;
    use crate::task::TaskKind;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed list of statuses, then succeeds.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<ExecStatus>>,
        calls: Mutex<Vec<u32>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<ExecStatus>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            invocation: &ToolInvocation,
            _profile: &ResourceProfile,
            attempt: u32,
        ) -> ExecStatus {
            self.calls.lock().push(attempt);
            self.script.lock().pop_front().unwrap_or(ExecStatus::Success {
                produced: invocation.outputs.clone(),
            })
        }
    }

    fn transient() -> ExecStatus {
        ExecStatus::TransientFailure {
            error: "copy failed".to_string(),
        }
    }

    fn preempted() -> ExecStatus {
        ExecStatus::Preempted {
            error: "instance reclaimed".to_string(),
        }
    }

    fn runner(
        script: Vec<ExecStatus>,
    ) -> (TaskRunner<ScriptedExecutor, InMemoryBudget<TaskClass>>, Arc<ScriptedExecutor>, Arc<InProcEventBus>) {
        let executor = Arc::new(ScriptedExecutor::new(script));
        let events = Arc::new(InProcEventBus::new(64));
        let config = RunnerConfig::default().with_transient(TransientRetryPolicy {
            max_attempts: 5,
            backoff_ms: 1,
        });
        let runner = TaskRunner::new(
            config,
            Arc::clone(&executor),
            Arc::new(InMemoryBudget::new(BudgetConfig::with_default(2))),
            events.clone(),
            RunId::new(),
            ShutdownToken::new(),
        );
        (runner, executor, events)
    }

    fn gather() -> ToolInvocation {
        ToolInvocation::new(TaskKind::SitesOnlyGather, "gatk")
            .output(Artifact::vcf("/out/callset.sites_only.vcf.gz"))
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_succeed() {
        let (runner, executor, _) = runner(vec![transient(), transient(), transient(), transient()]);

        let outputs = runner.run(&gather()).await.unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(*executor.calls.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_transient_budget_exhausted_is_fatal() {
        let (runner, executor, _) = runner(vec![transient(); 5]);

        let err = runner.run(&gather()).await.unwrap_err();

        assert!(matches!(
            err,
            TaskError::TransientBudgetExhausted { attempts: 5, .. }
        ));
        assert_eq!(executor.calls.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_third_preemption_is_fatal_with_default_max_retries() {
        let (runner, executor, _) = runner(vec![preempted(), preempted(), preempted()]);

        let err = runner.run(&gather()).await.unwrap_err();

        assert!(matches!(
            err,
            TaskError::PreemptionBudgetExhausted {
                preemptions: 3,
                max_retries: 2,
                ..
            }
        ));
        assert_eq!(executor.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_budgets_are_counted_separately() {
        // Two preemptions and four transient failures are all within budget.
        let (runner, executor, _) = runner(vec![
            preempted(),
            transient(),
            transient(),
            preempted(),
            transient(),
            transient(),
        ]);

        runner.run(&gather()).await.unwrap();
        assert_eq!(executor.calls.lock().len(), 7);
    }

    #[tokio::test]
    async fn test_success_without_declared_outputs_is_fatal() {
        let (runner, _, _) = runner(vec![ExecStatus::Success { produced: vec![] }]);

        let err = runner.run(&gather()).await.unwrap_err();

        match err {
            TaskError::MissingOutputs { missing, .. } => {
                assert_eq!(missing.len(), 2, "primary and index are both missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (runner, executor, _) = runner(vec![ExecStatus::PermanentFailure {
            error: "malformed input".to_string(),
        }]);

        let err = runner.run(&gather()).await.unwrap_err();

        assert!(matches!(err, TaskError::Permanent { .. }));
        assert_eq!(executor.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_events_published_for_retry_and_completion() {
        let (runner, _, events) = runner(vec![transient()]);
        let mut rx = events.subscribe();

        runner.run(&gather()).await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(match event.payload {
                TaskEventPayload::Started { .. } => "started",
                TaskEventPayload::Retrying { .. } => "retrying",
                TaskEventPayload::Completed { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(names, vec!["started", "retrying", "started", "completed"]);
    }

    #[tokio::test]
    async fn test_cancelled_runner_does_not_execute() {
        let (runner, executor, _) = runner(vec![]);
        runner.shutdown_token().cancel();

        let err = runner.run(&gather()).await.unwrap_err();

        assert!(matches!(err, TaskError::Cancelled { .. }));
        assert!(executor.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_budget_slot_released_after_attempts() {
        let (runner, _, _) = runner(vec![transient(), preempted()]);

        runner.run(&gather()).await.unwrap();

        let (inflight, _) = runner.budget().utilization(TaskClass::Gather).await.unwrap();
        assert_eq!(inflight, 0);
    }

    #[test]
    fn test_missing_outputs_compares_every_file() {
        let declared = vec![Artifact::vcf("/a.vcf.gz"), Artifact::plain("/a.tranches")];
        let produced = vec![Artifact::plain("/a.vcf.gz"), Artifact::plain("/a.tranches")];
        assert_eq!(
            missing_outputs(&declared, &produced),
            vec![PathBuf::from("/a.vcf.gz.tbi")]
        );
    }
}
