use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::task::{TaskClass, TaskId};

/// Category of work that compute slots are accounted against.
pub trait WorkloadKind: Copy + Eq + Hash + Send + Sync + Debug + 'static {}

impl WorkloadKind for TaskClass {}

/// A held compute slot.
///
/// Returned by [`Budget::try_acquire`] or [`Budget::acquire`]; hand it back
/// through [`Budget::release`] when the attempt ends.
#[derive(Debug)]
pub struct BudgetToken<W> {
    /// The workload class this slot was taken from.
    pub workload: W,
    /// The task holding the slot.
    pub task: TaskId,
    /// When the slot was taken.
    pub acquired_at: DateTime<Utc>,
}

impl<W> BudgetToken<W> {
    pub fn new(workload: W, task: TaskId) -> Self {
        Self {
            workload,
            task,
            acquired_at: Utc::now(),
        }
    }
}

/// Concurrency limits per workload class.
#[derive(Debug, Clone)]
pub struct BudgetConfig<W> {
    limits: HashMap<W, usize>,
    default_limit: usize,
}

impl<W: Eq + Hash + Clone> BudgetConfig<W> {
    pub fn new(limits: HashMap<W, usize>, default_limit: usize) -> Self {
        Self {
            limits,
            default_limit,
        }
    }

    /// Same limit for every class.
    pub fn with_default(default_limit: usize) -> Self {
        Self {
            limits: HashMap::new(),
            default_limit,
        }
    }

    pub fn with_limit(mut self, workload: W, limit: usize) -> Self {
        self.limits.insert(workload, limit);
        self
    }

    pub fn limit(&self, workload: &W) -> usize {
        self.limits
            .get(workload)
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }
}

impl<W: Eq + Hash> Default for BudgetConfig<W> {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            default_limit: 1,
        }
    }
}

/// Bounds how many tasks of each class run at once.
#[async_trait]
pub trait Budget<W>: Send + Sync
where
    W: WorkloadKind,
{
    /// Take a slot if one is free, otherwise return `None`.
    async fn try_acquire(
        &self,
        workload: W,
        task: TaskId,
    ) -> anyhow::Result<Option<Arc<BudgetToken<W>>>>;

    /// Wait until a slot is free and take it.
    async fn acquire(&self, workload: W, task: TaskId) -> anyhow::Result<Arc<BudgetToken<W>>>;

    /// Return a slot.
    async fn release(&self, token: Arc<BudgetToken<W>>) -> anyhow::Result<()>;

    /// `(in use, limit)` for a class.
    async fn utilization(&self, workload: W) -> anyhow::Result<(usize, usize)>;

    async fn has_budget(&self, workload: W) -> anyhow::Result<bool>;
}

/// In-process slot counter. Waiters are woken on every release.
pub struct InMemoryBudget<W> {
    config: BudgetConfig<W>,
    counters: Arc<Mutex<HashMap<W, usize>>>,
    released: Arc<Notify>,
}

impl<W> Debug for InMemoryBudget<W>
where
    W: WorkloadKind,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryBudget");

        match self.counters.try_lock() {
            Some(counters) => {
                debug.field("counters", &*counters);
            }
            None => {
                debug.field("counters", &"<locked>");
            }
        }

        debug.finish_non_exhaustive()
    }
}

impl<W: WorkloadKind> InMemoryBudget<W> {
    pub fn new(config: BudgetConfig<W>) -> Self {
        Self {
            config,
            counters: Arc::new(Mutex::new(HashMap::new())),
            released: Arc::new(Notify::new()),
        }
    }

    fn current_count(&self, workload: W) -> usize {
        self.counters.lock().get(&workload).copied().unwrap_or(0)
    }
}

#[async_trait]
impl<W> Budget<W> for InMemoryBudget<W>
where
    W: WorkloadKind,
{
    async fn try_acquire(
        &self,
        workload: W,
        task: TaskId,
    ) -> anyhow::Result<Option<Arc<BudgetToken<W>>>> {
        let limit = self.config.limit(&workload);
        let mut counters = self.counters.lock();
        let current = counters.entry(workload).or_insert(0);

        if *current < limit {
            *current += 1;
            Ok(Some(Arc::new(BudgetToken::new(workload, task))))
        } else {
            Ok(None)
        }
    }

    async fn acquire(&self, workload: W, task: TaskId) -> anyhow::Result<Arc<BudgetToken<W>>> {
        loop {
            // Register interest before checking so a release in between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(token) = self.try_acquire(workload, task).await? {
                return Ok(token);
            }
            notified.await;
        }
    }

    async fn release(&self, token: Arc<BudgetToken<W>>) -> anyhow::Result<()> {
        {
            let mut counters = self.counters.lock();
            if let Some(count) = counters.get_mut(&token.workload) {
                *count = count.saturating_sub(1);
            }
        }
        self.released.notify_waiters();
        Ok(())
    }

    async fn utilization(&self, workload: W) -> anyhow::Result<(usize, usize)> {
        Ok((self.current_count(workload), self.config.limit(&workload)))
    }

    async fn has_budget(&self, workload: W) -> anyhow::Result<bool> {
        let (current, limit) = self.utilization(workload).await?;
        Ok(current < limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_budget_enforces_concurrency_limits() {
        let budget = InMemoryBudget::new(BudgetConfig::with_default(2));
        let class = TaskClass::Genotype;

        let token1 = budget.acquire(class, TaskId::new()).await.unwrap();
        let token2 = budget
            .try_acquire(class, TaskId::new())
            .await
            .unwrap()
            .unwrap();

        let (current, limit) = budget.utilization(class).await.unwrap();
        assert_eq!(current, 2);
        assert_eq!(limit, 2);

        let token3 = budget.try_acquire(class, TaskId::new()).await.unwrap();
        assert!(token3.is_none(), "Should return None when at capacity");
        assert!(!budget.has_budget(class).await.unwrap());

        budget.release(token1).await.unwrap();

        let token3 = budget
            .try_acquire(class, TaskId::new())
            .await
            .unwrap()
            .unwrap();

        budget.release(token2).await.unwrap();
        budget.release(token3).await.unwrap();

        let (current, _) = budget.utilization(class).await.unwrap();
        assert_eq!(current, 0);
    }

    #[tokio::test]
    async fn test_budget_per_class_limits() {
        let config = BudgetConfig::with_default(2)
            .with_limit(TaskClass::Import, 1)
            .with_limit(TaskClass::Apply, 3);
        let budget = InMemoryBudget::new(config);

        let import = budget
            .try_acquire(TaskClass::Import, TaskId::new())
            .await
            .unwrap()
            .unwrap();
        assert!(budget
            .try_acquire(TaskClass::Import, TaskId::new())
            .await
            .unwrap()
            .is_none());

        let mut apply = Vec::new();
        for _ in 0..3 {
            apply.push(
                budget
                    .try_acquire(TaskClass::Apply, TaskId::new())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert!(budget
            .try_acquire(TaskClass::Apply, TaskId::new())
            .await
            .unwrap()
            .is_none());

        budget.release(import).await.unwrap();
        for token in apply {
            budget.release(token).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_acquire_wakes_on_release() {
        let budget = Arc::new(InMemoryBudget::new(BudgetConfig::with_default(1)));
        let held = budget.acquire(TaskClass::Gather, TaskId::new()).await.unwrap();

        let waiter = {
            let budget = Arc::clone(&budget);
            tokio::spawn(async move { budget.acquire(TaskClass::Gather, TaskId::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        budget.release(held).await.unwrap();
        let token = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken by release")
            .unwrap()
            .unwrap();
        assert_eq!(token.workload, TaskClass::Gather);
    }

    #[tokio::test]
    async fn test_saturating_sub_safety() {
        let budget = InMemoryBudget::new(BudgetConfig::with_default(1));
        let token = Arc::new(BudgetToken::new(TaskClass::Metrics, TaskId::new()));

        budget.release(token).await.unwrap();

        let (current, _) = budget.utilization(TaskClass::Metrics).await.unwrap();
        assert_eq!(current, 0);
    }
}
