use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::TaskError;
use crate::graph::NodeKey;
use crate::router::GatherBranch;
use crate::task::{RunId, ShardIndex, TaskId, TaskKind};

/// Metadata envelope attached to every task event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub run_id: RunId,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(run_id: RunId, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            run_id,
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskEvent {
    pub meta: EventMeta,
    pub payload: TaskEventPayload,
}

impl TaskEvent {
    pub fn new(run_id: RunId, payload: TaskEventPayload) -> Self {
        let key = payload.idempotency_key();
        Self {
            meta: EventMeta::new(run_id, key),
            payload,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    Transient,
    Preempted,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::Transient => "transient",
            RetryReason::Preempted => "preempted",
        }
    }
}

/// Fan-in points of the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Barrier {
    SitesOnlyGather,
    TrancheGather,
    FinalGather,
}

impl Barrier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Barrier::SitesOnlyGather => "sites_only_gather",
            Barrier::TrancheGather => "tranche_gather",
            Barrier::FinalGather => "final_gather",
        }
    }
}

/// Lifecycle transitions of tasks and run-level decisions.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TaskEventPayload {
    /// An attempt began.
    Started {
        task_id: TaskId,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        attempt: u32,
    },
    /// An attempt failed and another one is scheduled.
    Retrying {
        task_id: TaskId,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        attempt: u32,
        reason: RetryReason,
        delay_ms: u64,
    },
    Completed {
        task_id: TaskId,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        attempts: u32,
    },
    /// Retry budgets are spent; the failure is fatal for the task.
    Failed {
        task_id: TaskId,
        kind: TaskKind,
        shard: Option<ShardIndex>,
        error: TaskError,
    },
    /// A node will not run because `cause` failed upstream.
    Aborted { node: NodeKey, cause: NodeKey },
    /// Every input of a fan-in point is available.
    BarrierReached { barrier: Barrier, inputs: usize },
    BranchSelected { branch: GatherBranch },
}

impl TaskEventPayload {
    fn idempotency_key(&self) -> String {
        match self {
            TaskEventPayload::Started { task_id, attempt, .. } => {
                format!("started-{task_id}-{attempt}")
            }
            TaskEventPayload::Retrying { task_id, attempt, .. } => {
                format!("retrying-{task_id}-{attempt}")
            }
            TaskEventPayload::Completed { task_id, .. } => format!("completed-{task_id}"),
            TaskEventPayload::Failed { task_id, .. } => format!("failed-{task_id}"),
            TaskEventPayload::Aborted { node, .. } => format!("aborted-{node}"),
            TaskEventPayload::BarrierReached { barrier, .. } => {
                format!("barrier-{}", barrier.as_str())
            }
            TaskEventPayload::BranchSelected { branch } => format!("branch-{branch}"),
        }
    }
}

/// Publishes task events to interested parties.
#[async_trait]
pub trait TaskEventPublisher: Send + Sync {
    async fn publish(&self, event: TaskEvent) -> anyhow::Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent>;
}

/// In-process fan-out bus over a tokio broadcast channel.
///
/// Publishing never blocks. A subscriber that falls more than `capacity`
/// events behind receives `RecvError::Lagged`; with no subscribers events
/// are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<TaskEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish_event(&self, event: TaskEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl TaskEventPublisher for InProcEventBus {
    async fn publish(&self, event: TaskEvent) -> anyhow::Result<()> {
        self.publish_event(event)
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.subscribe_events()
    }
}
