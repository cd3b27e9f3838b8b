use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::model::{TaskItem, TaskState};

/// Events emitted by the execution core.
///
/// Delivery is best-effort, at-least-once. For a given `task_id` events are
/// observed in the order the core emits them; no ordering holds across
/// tasks, so consumers filter by id. Parent progress derived by aggregation
/// carries the `"Aggregated from N children"` details marker and a `None`
/// payload so consumers can tell it apart from leaf progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    Created(TaskItem),
    Updated(TaskItem),
    Deleted {
        task_id: Uuid,
        owner_id: String,
    },
    StateChanged {
        task_id: Uuid,
        owner_id: String,
        state: TaskState,
        details: Option<String>,
    },
    Progress {
        task_id: Uuid,
        owner_id: String,
        percentage: f64,
        details: Option<String>,
        payload: Option<Value>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::Created(task) | TaskEvent::Updated(task) => task.id,
            TaskEvent::Deleted { task_id, .. }
            | TaskEvent::StateChanged { task_id, .. }
            | TaskEvent::Progress { task_id, .. } => *task_id,
        }
    }
}

/// Fire-and-forget event sink.
///
/// Publishing must never fail the core: implementations swallow their own
/// errors. The core awaits `publish` inline, which is what preserves the
/// per-task ordering guarantee.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, event: TaskEvent);
}

/// Publisher backed by a tokio broadcast channel.
///
/// Send errors (no subscribers) are ignored; slow subscribers observe
/// `Lagged` and miss events, which the at-least-once contract permits.
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<TaskEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: TaskEvent) {
        trace!(task_id = %event.task_id(), "publishing event");
        let _ = self.sender.send(event);
    }
}

/// Publisher that drops everything. Useful in tests and headless embeddings.
#[derive(Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _event: TaskEvent) {}
}
