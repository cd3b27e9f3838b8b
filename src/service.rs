use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::RunningTasks;
use crate::error::{EngineError, Result};
use crate::events::{EventPublisher, TaskEvent};
use crate::model::{CreateTaskRequest, TaskItem, TaskState, TaskTree, UpdateTaskRequest};
use crate::progress::ProgressAggregator;
use crate::queue::GroupedTaskQueue;
use crate::repository::TaskRepository;

pub(crate) const CANCELLED_BY_USER: &str = "Cancelled by user request";
pub(crate) const CANCELLED_WITH_SUBTREE: &str = "Cancelled by user request (with subtree)";
pub(crate) const CANCELLED_CASCADE: &str = "Cancelled (cascade from parent)";

/// Public operation surface of the engine: creation, cancellation,
/// deletion, subtask management and queued-payload updates.
///
/// The service writes task rows outside of execution; during execution the
/// dispatcher is the sole writer. Cancellation is the one deliberate
/// crossover: the service transitions the row to `Cancelled` first and then
/// fires the running signal, so the worker's terminal write never overwrites
/// it.
pub struct TaskService {
    repo: Arc<dyn TaskRepository>,
    queue: Arc<GroupedTaskQueue>,
    publisher: Arc<dyn EventPublisher>,
    aggregator: Arc<ProgressAggregator>,
    running: Arc<RunningTasks>,
}

impl TaskService {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        queue: Arc<GroupedTaskQueue>,
        publisher: Arc<dyn EventPublisher>,
        aggregator: Arc<ProgressAggregator>,
        running: Arc<RunningTasks>,
    ) -> Self {
        Self {
            repo,
            queue,
            publisher,
            aggregator,
            running,
        }
    }

    async fn load(&self, id: Uuid) -> Result<TaskItem> {
        self.repo
            .get(id)
            .await?
            .ok_or(EngineError::TaskNotFound { task_id: id })
    }

    async fn load_owned(&self, id: Uuid, owner: &str) -> Result<TaskItem> {
        let task = self.load(id).await?;
        if task.owner_id != owner {
            return Err(EngineError::forbidden(id));
        }
        Ok(task)
    }

    /// Create a single task. A task naming a parent inherits the parent's
    /// root, owner, auth token and history flag; the parent must exist and
    /// belong to the same owner.
    pub async fn create(
        &self,
        owner: &str,
        req: CreateTaskRequest,
        auth_token: Option<String>,
    ) -> Result<TaskItem> {
        let task = match req.parent_task_id {
            Some(parent_id) => {
                let parent = self.repo.get(parent_id).await?.ok_or_else(|| {
                    EngineError::invalid_request(format!("parent task {parent_id} not found"))
                })?;
                if parent.owner_id != owner {
                    return Err(EngineError::invalid_request(format!(
                        "parent task {parent_id} belongs to another owner"
                    )));
                }
                TaskItem::child_of(&parent, &req)
            }
            None => TaskItem::from_request(owner, &req, auth_token),
        };

        if self.repo.get(task.id).await?.is_some() {
            return Err(EngineError::invalid_request(format!(
                "task {} already exists",
                task.id
            )));
        }

        self.repo.put(task.clone()).await?;
        // Created goes out before the task can be dispatched, so per-task
        // event order starts with it.
        self.publisher.publish(TaskEvent::Created(task.clone())).await;
        self.queue.enqueue(task.id, &task.group_id, task.priority);
        info!(task_id = %task.id, task_type = %task.task_type, group = %task.group_id, "task created");
        Ok(task)
    }

    /// Materialize a whole hierarchy atomically. Only the root is enqueued;
    /// children are launched by the parent's orchestration when it runs.
    pub async fn create_hierarchy(
        &self,
        owner: &str,
        tree: TaskTree,
        auth_token: Option<String>,
    ) -> Result<TaskItem> {
        let root = TaskItem::from_request(owner, &tree.task, auth_token);
        let mut nodes = vec![root.clone()];
        collect_children(&root, &tree.children, &mut nodes);

        self.repo.add_batch(nodes.clone()).await?;
        for node in &nodes {
            self.publisher.publish(TaskEvent::Created(node.clone())).await;
        }
        self.queue.enqueue(root.id, &root.group_id, root.priority);
        info!(root_id = %root.id, nodes = nodes.len(), "hierarchy created");
        Ok(root)
    }

    /// Fetch a task; foreign-owned tasks read as absent.
    pub async fn get(&self, id: Uuid, owner: &str) -> Result<Option<TaskItem>> {
        Ok(self
            .repo
            .get(id)
            .await?
            .filter(|task| task.owner_id == owner))
    }

    /// All tasks of an owner, newest first.
    pub async fn list_by_owner(&self, owner: &str) -> Result<Vec<TaskItem>> {
        self.repo.get_by_owner(owner).await
    }

    /// Immediate children of an owned task, in creation order.
    pub async fn children(&self, parent_id: Uuid, owner: &str) -> Result<Vec<TaskItem>> {
        self.load_owned(parent_id, owner).await?;
        self.repo.get_children(parent_id).await
    }

    /// Update priority and/or payload of a still-queued task.
    pub async fn update(
        &self,
        id: Uuid,
        owner: &str,
        req: UpdateTaskRequest,
    ) -> Result<TaskItem> {
        let mut task = self.load_owned(id, owner).await?;
        if task.state != TaskState::Queued {
            return Err(EngineError::invalid_state(id, task.state, "update"));
        }

        let requeue = match req.priority {
            Some(priority) if priority != task.priority => {
                task.priority = priority;
                true
            }
            _ => false,
        };
        if let Some(payload) = req.payload {
            task.payload = payload;
        }
        task.touch();
        if !self
            .repo
            .put_if_state(task.clone(), TaskState::Queued)
            .await?
        {
            let state = self.load(id).await?.state;
            return Err(EngineError::invalid_state(id, state, "update"));
        }
        self.publisher.publish(TaskEvent::Updated(task.clone())).await;

        // Re-key the queue entry; a queued child a sequential parent has not
        // launched yet is not in the queue, so only re-enqueue what was there.
        if requeue && self.queue.try_cancel(id) {
            self.queue.enqueue(id, &task.group_id, task.priority);
        }
        Ok(task)
    }

    /// Cancel a queued or executing task.
    pub async fn cancel(&self, id: Uuid, owner: &str) -> Result<TaskItem> {
        let task = self.load_owned(id, owner).await?;
        if task.state.is_terminal() {
            return Err(EngineError::invalid_state(id, task.state, "cancel"));
        }
        self.cancel_live(id, CANCELLED_BY_USER).await
    }

    /// Cancel a whole subtree, descendants leaves-first, the root last.
    /// Already-terminal nodes are skipped without events.
    pub async fn cancel_subtree(&self, id: Uuid, owner: &str) -> Result<TaskItem> {
        let root = self.load_owned(id, owner).await?;

        let descendants = self.repo.get_descendants(id).await?;
        for task in descendants.into_iter().rev() {
            if !task.state.is_terminal() {
                self.cancel_live(task.id, CANCELLED_CASCADE).await?;
            }
        }

        if root.state.is_terminal() {
            return Ok(root);
        }
        self.cancel_live(id, CANCELLED_WITH_SUBTREE).await
    }

    /// Delete a task, cancelling it first when still live.
    pub async fn delete(&self, id: Uuid, owner: &str) -> Result<()> {
        let task = self.load_owned(id, owner).await?;
        if !task.state.is_terminal() {
            self.cancel_live(id, CANCELLED_BY_USER).await?;
        }
        self.repo.delete(id).await?;
        self.publisher
            .publish(TaskEvent::Deleted {
                task_id: id,
                owner_id: task.owner_id,
            })
            .await;
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Delete a subtree: cancel what is live, then remove exactly the
    /// subtree from the repository, leaves first, with one `Deleted` event
    /// per removed node.
    pub async fn delete_subtree(&self, id: Uuid, owner: &str) -> Result<()> {
        let root = self.load_owned(id, owner).await?;

        let descendants = self.repo.get_descendants(id).await?;
        for task in descendants.into_iter().rev() {
            if !task.state.is_terminal() {
                self.cancel_live(task.id, CANCELLED_CASCADE).await?;
            }
        }
        if !root.state.is_terminal() {
            self.cancel_live(id, CANCELLED_WITH_SUBTREE).await?;
        }

        let removed = self.repo.delete_subtree(id).await?;
        join_all(removed.into_iter().map(|task_id| {
            self.publisher.publish(TaskEvent::Deleted {
                task_id,
                owner_id: root.owner_id.clone(),
            })
        }))
        .await;
        Ok(())
    }

    /// Attach a new child to an executing parent and enqueue it.
    pub async fn add_subtask(&self, parent_id: Uuid, req: CreateTaskRequest) -> Result<TaskItem> {
        let parent = self.load(parent_id).await?;
        if parent.state != TaskState::Executing {
            return Err(EngineError::invalid_state(
                parent_id,
                parent.state,
                "add_subtask",
            ));
        }

        let child = TaskItem::child_of(&parent, &req);
        if self.repo.get(child.id).await?.is_some() {
            return Err(EngineError::invalid_request(format!(
                "task {} already exists",
                child.id
            )));
        }
        self.repo.put(child.clone()).await?;
        self.publisher
            .publish(TaskEvent::Created(child.clone()))
            .await;
        self.queue
            .enqueue(child.id, &child.group_id, child.priority);
        self.aggregator.task_changed(&child).await;
        debug!(parent_id = %parent_id, child_id = %child.id, "subtask added");
        Ok(child)
    }

    /// Attach several children, returned in input order.
    pub async fn add_subtasks(
        &self,
        parent_id: Uuid,
        reqs: Vec<CreateTaskRequest>,
    ) -> Result<Vec<TaskItem>> {
        let mut created = Vec::with_capacity(reqs.len());
        for req in reqs {
            created.push(self.add_subtask(parent_id, req).await?);
        }
        Ok(created)
    }

    /// Write a task's output bytes. Valid in any state; retried when a
    /// concurrent state transition invalidates the read.
    pub async fn set_output(&self, id: Uuid, output: Bytes) -> Result<()> {
        loop {
            let task = self.load(id).await?;
            let mut updated = task.clone();
            updated.output = Some(output.clone());
            updated.touch();
            if self.repo.put_if_state(updated, task.state).await? {
                return Ok(());
            }
        }
    }

    /// Replace the payload of a still-queued task. This is the hand-off used
    /// by sequential parents to feed one child's output into the next.
    pub async fn update_queued_payload(&self, id: Uuid, payload: Value) -> Result<TaskItem> {
        let mut task = self.load(id).await?;
        if task.state != TaskState::Queued {
            return Err(EngineError::invalid_state(
                id,
                task.state,
                "update_queued_payload",
            ));
        }
        task.payload = payload;
        task.touch();
        if !self
            .repo
            .put_if_state(task.clone(), TaskState::Queued)
            .await?
        {
            let state = self.load(id).await?.state;
            return Err(EngineError::invalid_state(id, state, "update_queued_payload"));
        }
        Ok(task)
    }

    /// Transition a live task to `Cancelled`: tombstone it when queued, fire
    /// the running signal when executing. The row is written before the
    /// signal fires so the worker observes the cancelled state. The write is
    /// conditional on the state it was derived from; on a lost race the
    /// check restarts, and a task that reached a terminal state is left
    /// untouched.
    async fn cancel_live(&self, id: Uuid, details: &str) -> Result<TaskItem> {
        let (task, was_queued, was_executing) = loop {
            let current = self.load(id).await?;
            if current.state.is_terminal() {
                return Ok(current);
            }

            let mut cancelled = current.clone();
            cancelled.state = TaskState::Cancelled;
            cancelled.state_details = Some(details.to_string());
            cancelled.completed_at = Some(Utc::now());
            cancelled.touch();
            if self
                .repo
                .put_if_state(cancelled.clone(), current.state)
                .await?
            {
                break (
                    cancelled,
                    current.state == TaskState::Queued,
                    current.state == TaskState::Executing,
                );
            }
        };

        if was_queued {
            self.queue.try_cancel(task.id);
        }

        self.publisher
            .publish(TaskEvent::StateChanged {
                task_id: task.id,
                owner_id: task.owner_id.clone(),
                state: TaskState::Cancelled,
                details: Some(details.to_string()),
            })
            .await;
        self.aggregator.task_changed(&task).await;

        // A task caught between dequeue and its Executing write already has a
        // registered signal; fire unconditionally so that race resolves to
        // cancellation as well.
        let fired = self.running.cancel(&task.id);
        if was_executing && !fired {
            warn!(task_id = %task.id, "no running signal registered for executing task");
        }
        info!(task_id = %task.id, details, "task cancelled");
        Ok(task)
    }
}

/// Depth-first materialization of a hierarchy, parents before children.
fn collect_children(parent: &TaskItem, children: &[TaskTree], out: &mut Vec<TaskItem>) {
    for tree in children {
        let child = TaskItem::child_of(parent, &tree.task);
        out.push(child.clone());
        collect_children(&child, &tree.children, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::events::BroadcastEventPublisher;
    use crate::repository::InMemoryTaskRepository;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Fixture {
        service: TaskService,
        repo: Arc<InMemoryTaskRepository>,
        queue: Arc<GroupedTaskQueue>,
        running: Arc<RunningTasks>,
        events: broadcast::Receiver<TaskEvent>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let queue = Arc::new(GroupedTaskQueue::new());
        let publisher = Arc::new(BroadcastEventPublisher::new(256));
        let events = publisher.subscribe();
        let aggregator = Arc::new(ProgressAggregator::new(
            repo.clone() as Arc<dyn TaskRepository>,
            publisher.clone() as Arc<dyn EventPublisher>,
        ));
        let running = Arc::new(RunningTasks::new());
        let service = TaskService::new(
            repo.clone(),
            queue.clone(),
            publisher,
            aggregator,
            running.clone(),
        );
        Fixture {
            service,
            repo,
            queue,
            running,
            events,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn create_enqueues_and_publishes() {
        let mut fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(fx.queue.len(), 1);
        let events = drain(&mut fx.events);
        assert!(matches!(&events[0], TaskEvent::Created(t) if t.id == task.id));
    }

    #[tokio::test]
    async fn create_rejects_missing_or_foreign_parent() {
        let fx = fixture();

        let mut req = CreateTaskRequest::new("t", json!({}));
        req.parent_task_id = Some(Uuid::new_v4());
        let err = fx.service.create("alice", req, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let parent = fx
            .service
            .create("bob", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();
        let mut req = CreateTaskRequest::new("t", json!({}));
        req.parent_task_id = Some(parent.id);
        let err = fx.service.create("alice", req, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn hierarchy_enqueues_only_root() {
        let mut fx = fixture();
        let tree = TaskTree::new(CreateTaskRequest::new("root", json!({})))
            .child(TaskTree::new(CreateTaskRequest::new("a", json!({}))))
            .child(
                TaskTree::new(CreateTaskRequest::new("b", json!({})))
                    .child(TaskTree::new(CreateTaskRequest::new("c", json!({})))),
            );

        let root = fx
            .service
            .create_hierarchy("alice", tree, Some("tok".into()))
            .await
            .unwrap();

        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.repo.len(), 4);

        let descendants = fx.repo.get_descendants(root.id).await.unwrap();
        assert_eq!(descendants.len(), 3);
        for node in &descendants {
            assert_eq!(node.root_task_id, root.id);
            assert_eq!(node.owner_id, "alice");
            assert_eq!(node.auth_token.as_deref(), Some("tok"));
        }

        let created = drain(&mut fx.events)
            .into_iter()
            .filter(|e| matches!(e, TaskEvent::Created(_)))
            .count();
        assert_eq!(created, 4);
    }

    #[tokio::test]
    async fn get_filters_foreign_owner() {
        let fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();

        assert!(fx.service.get(task.id, "alice").await.unwrap().is_some());
        assert!(fx.service.get(task.id, "mallory").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_requires_queued_state() {
        let fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();

        let updated = fx
            .service
            .update(
                task.id,
                "alice",
                UpdateTaskRequest {
                    priority: Some(9),
                    payload: Some(json!({"v": 2})),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, 9);
        assert_eq!(updated.payload, json!({"v": 2}));

        let mut executing = updated.clone();
        executing.state = TaskState::Executing;
        fx.repo.put(executing).await.unwrap();
        let err = fx
            .service
            .update(task.id, "alice", UpdateTaskRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn update_priority_rekeys_queue() {
        let fx = fixture();
        let low = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})).priority(1), None)
            .await
            .unwrap();
        let high = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})).priority(5), None)
            .await
            .unwrap();

        fx.service
            .update(
                low.id,
                "alice",
                UpdateTaskRequest {
                    priority: Some(10),
                    payload: None,
                },
            )
            .await
            .unwrap();

        let (first, _) = fx.queue.dequeue().await;
        assert_eq!(first, low.id);
        let (second, _) = fx.queue.dequeue().await;
        assert_eq!(second, high.id);
    }

    #[tokio::test]
    async fn cancel_queued_tombstones_and_publishes() {
        let mut fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();
        drain(&mut fx.events);

        let cancelled = fx.service.cancel(task.id, "alice").await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert_eq!(cancelled.state_details.as_deref(), Some(CANCELLED_BY_USER));
        assert!(cancelled.completed_at.is_some());
        assert!(fx.queue.is_empty());

        let events = drain(&mut fx.events);
        assert!(matches!(
            &events[0],
            TaskEvent::StateChanged {
                state: TaskState::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancel_executing_fires_running_signal() {
        let fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();

        let mut executing = task.clone();
        executing.state = TaskState::Executing;
        fx.repo.put(executing).await.unwrap();
        let signal = CancelSignal::new();
        fx.running.register(task.id, signal.clone());

        fx.service.cancel(task.id, "alice").await.unwrap();
        assert!(signal.is_cancelled());
        let stored = fx.repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_terminal_is_rejected_without_events() {
        let mut fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();
        let mut done = task.clone();
        done.state = TaskState::Completed;
        fx.repo.put(done).await.unwrap();
        drain(&mut fx.events);

        let err = fx.service.cancel(task.id, "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert!(drain(&mut fx.events).is_empty());
    }

    #[tokio::test]
    async fn cancel_subtree_walks_leaves_first() {
        let mut fx = fixture();
        let tree = TaskTree::new(CreateTaskRequest::new("root", json!({}))).child(
            TaskTree::new(CreateTaskRequest::new("mid", json!({})))
                .child(TaskTree::new(CreateTaskRequest::new("leaf", json!({})))),
        );
        let root = fx.service.create_hierarchy("alice", tree, None).await.unwrap();
        drain(&mut fx.events);

        fx.service.cancel_subtree(root.id, "alice").await.unwrap();

        let descendants = fx.repo.get_descendants(root.id).await.unwrap();
        for node in &descendants {
            assert_eq!(node.state, TaskState::Cancelled);
            assert_eq!(node.state_details.as_deref(), Some(CANCELLED_CASCADE));
        }
        let root_after = fx.repo.get(root.id).await.unwrap().unwrap();
        assert_eq!(root_after.state, TaskState::Cancelled);
        assert_eq!(
            root_after.state_details.as_deref(),
            Some(CANCELLED_WITH_SUBTREE)
        );

        // Leaves cancel before their ancestors.
        let order: Vec<Uuid> = drain(&mut fx.events)
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::StateChanged { task_id, .. } => Some(task_id),
                _ => None,
            })
            .collect();
        assert_eq!(*order.last().unwrap(), root.id);
    }

    #[tokio::test]
    async fn delete_cancels_live_then_removes() {
        let mut fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();
        drain(&mut fx.events);

        fx.service.delete(task.id, "alice").await.unwrap();
        assert!(fx.repo.get(task.id).await.unwrap().is_none());

        let events = drain(&mut fx.events);
        assert!(matches!(
            events[0],
            TaskEvent::StateChanged {
                state: TaskState::Cancelled,
                ..
            }
        ));
        assert!(matches!(events.last().unwrap(), TaskEvent::Deleted { task_id, .. } if *task_id == task.id));
    }

    #[tokio::test]
    async fn delete_subtree_publishes_per_node() {
        let mut fx = fixture();
        let tree = TaskTree::new(CreateTaskRequest::new("root", json!({})))
            .child(TaskTree::new(CreateTaskRequest::new("a", json!({}))))
            .child(TaskTree::new(CreateTaskRequest::new("b", json!({}))));
        let root = fx.service.create_hierarchy("alice", tree, None).await.unwrap();
        drain(&mut fx.events);

        fx.service.delete_subtree(root.id, "alice").await.unwrap();
        assert!(fx.repo.is_empty());

        let deleted = drain(&mut fx.events)
            .into_iter()
            .filter(|e| matches!(e, TaskEvent::Deleted { .. }))
            .count();
        assert_eq!(deleted, 3);
    }

    #[tokio::test]
    async fn add_subtask_requires_executing_parent() {
        let fx = fixture();
        let parent = fx
            .service
            .create("alice", CreateTaskRequest::new("batch", json!({})), None)
            .await
            .unwrap();

        let err = fx
            .service
            .add_subtask(parent.id, CreateTaskRequest::new("step", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        let mut executing = parent.clone();
        executing.state = TaskState::Executing;
        fx.repo.put(executing).await.unwrap();

        let child = fx
            .service
            .add_subtask(parent.id, CreateTaskRequest::new("step", json!({})))
            .await
            .unwrap();
        assert_eq!(child.parent_task_id, Some(parent.id));
        assert_eq!(child.root_task_id, parent.id);
        assert_eq!(fx.queue.len(), 2);
    }

    #[tokio::test]
    async fn queued_payload_update_is_state_guarded() {
        let fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({"v": 1})), None)
            .await
            .unwrap();

        let updated = fx
            .service
            .update_queued_payload(task.id, json!({"v": 2}))
            .await
            .unwrap();
        assert_eq!(updated.payload, json!({"v": 2}));

        let mut executing = updated.clone();
        executing.state = TaskState::Executing;
        fx.repo.put(executing).await.unwrap();
        let err = fx
            .service
            .update_queued_payload(task.id, json!({"v": 3}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn set_output_roundtrip() {
        let fx = fixture();
        let task = fx
            .service
            .create("alice", CreateTaskRequest::new("t", json!({})), None)
            .await
            .unwrap();

        fx.service
            .set_output(task.id, Bytes::from_static(b"42"))
            .await
            .unwrap();
        let stored = fx.repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.output.as_deref(), Some(b"42".as_ref()));
    }
}
