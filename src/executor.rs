use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::events::{EventPublisher, TaskEvent};
use crate::model::{CreateTaskRequest, ProgressUpdate, StateChange, TaskItem};
use crate::progress::ProgressAggregator;
use crate::repository::TaskRepository;
use crate::service::TaskService;

/// A unit-of-work implementation for one task type.
///
/// `execute` runs leaf work: it should observe `cancel` between units of
/// work and may report progress zero or more times. The remaining methods
/// are parent hooks with no-op defaults; they only fire when the executor
/// backs a parent task type.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Type key this executor is registered under.
    fn task_type(&self) -> &str;

    async fn execute(
        &self,
        ctx: TaskContext,
        progress: ProgressReporter,
        cancel: CancelSignal,
    ) -> anyhow::Result<()>;

    /// A child of a parent backed by this executor reported progress.
    async fn on_subtask_progress(
        &self,
        _parent: &TaskItem,
        _child: &TaskItem,
        _update: &ProgressUpdate,
    ) {
    }

    /// A child entered a terminal state. Fired immediately before
    /// `on_subtask_terminal`, once per child.
    async fn on_subtask_state_change(
        &self,
        _parent: &TaskItem,
        _child: &TaskItem,
        _change: &StateChange,
    ) {
    }

    /// A child entered a terminal state. Returned requests are appended to
    /// the parent as new children; in sequential mode they run before the
    /// remaining siblings.
    async fn on_subtask_terminal(
        &self,
        _parent: &TaskItem,
        _child: &TaskItem,
        _change: &StateChange,
    ) -> Option<Vec<CreateTaskRequest>> {
        None
    }

    /// Every child of the parent reached `Completed`.
    async fn on_all_subtasks_success(&self, _parent: &TaskItem, _children: &[TaskItem]) {}
}

/// Registry mapping task type to executor.
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    pub fn register(&self, executor: Arc<dyn TaskExecutor>) {
        let task_type = executor.task_type().to_string();
        if self
            .executors
            .insert(task_type.clone(), executor)
            .is_some()
        {
            warn!(task_type = %task_type, "replacing previously registered executor");
        }
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).map(|e| e.clone())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an executor needs while running a task: a snapshot of the row
/// plus a service handle for output writing and dynamic subtask management.
#[derive(Clone)]
pub struct TaskContext {
    task: TaskItem,
    service: Arc<TaskService>,
}

impl TaskContext {
    pub fn new(task: TaskItem, service: Arc<TaskService>) -> Self {
        Self { task, service }
    }

    pub fn task(&self) -> &TaskItem {
        &self.task
    }

    pub fn task_id(&self) -> Uuid {
        self.task.id
    }

    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    pub fn service(&self) -> &Arc<TaskService> {
        &self.service
    }

    /// Write this task's output, readable by parent hooks after completion.
    pub async fn set_output(&self, output: Bytes) -> Result<()> {
        self.service.set_output(self.task.id, output).await
    }
}

/// Progress sink handed to executors.
///
/// Each report writes the task's progress fields, publishes a `Progress`
/// event, feeds the aggregator, and synchronously notifies the parent's
/// executor when the task has one. Reports after the task reached a
/// terminal state are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: Uuid,
    repo: Arc<dyn TaskRepository>,
    publisher: Arc<dyn EventPublisher>,
    aggregator: Arc<ProgressAggregator>,
    registry: Arc<ExecutorRegistry>,
}

impl ProgressReporter {
    pub(crate) fn new(
        task_id: Uuid,
        repo: Arc<dyn TaskRepository>,
        publisher: Arc<dyn EventPublisher>,
        aggregator: Arc<ProgressAggregator>,
        registry: Arc<ExecutorRegistry>,
    ) -> Self {
        Self {
            task_id,
            repo,
            publisher,
            aggregator,
            registry,
        }
    }

    pub async fn report(&self, percentage: f64, details: Option<String>, payload: Option<Value>) {
        let percentage = percentage.clamp(0.0, 100.0);

        let mut task = match self.repo.get(self.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "progress report dropped");
                return;
            }
        };
        if task.state.is_terminal() {
            trace!(task_id = %self.task_id, "ignoring progress report on terminal task");
            return;
        }

        let prior_state = task.state;
        task.progress = percentage;
        task.progress_details = details.clone();
        task.progress_payload = payload.clone();
        task.touch();
        let snapshot = task.clone();

        // Conditional on the state the report was derived from: a report
        // racing a cancel is dropped rather than resurrecting the old state.
        match self.repo.put_if_state(task, prior_state).await {
            Ok(true) => {}
            Ok(false) => {
                trace!(task_id = %self.task_id, "progress report lost a state race, dropped");
                return;
            }
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "failed to persist progress");
                return;
            }
        }

        self.publisher
            .publish(TaskEvent::Progress {
                task_id: snapshot.id,
                owner_id: snapshot.owner_id.clone(),
                percentage,
                details: details.clone(),
                payload: payload.clone(),
            })
            .await;

        self.aggregator.task_changed(&snapshot).await;

        if let Some(parent_id) = snapshot.parent_task_id {
            if let Ok(Some(parent)) = self.repo.get(parent_id).await {
                if let Some(executor) = self.registry.get(&parent.task_type) {
                    let update = ProgressUpdate {
                        percentage,
                        details,
                        payload,
                    };
                    executor
                        .on_subtask_progress(&parent, &snapshot, &update)
                        .await;
                }
            }
        }
    }
}
