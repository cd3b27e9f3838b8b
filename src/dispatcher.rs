use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelSignal, RunningTasks};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{EventPublisher, TaskEvent};
use crate::executor::{ExecutorRegistry, ProgressReporter, TaskContext, TaskExecutor};
use crate::gate::GroupGates;
use crate::model::{StateChange, TaskItem, TaskState};
use crate::progress::ProgressAggregator;
use crate::queue::GroupedTaskQueue;
use crate::repository::TaskRepository;
use crate::service::TaskService;

/// Terminal details written when a task is reclaimed by timeout or shutdown
/// rather than by an external cancel.
pub(crate) const TERMINATED_DETAILS: &str = "timed out or terminated";

/// Pulls tasks off the queue and runs them.
///
/// The dispatch loop is single-threaded so priority selection across groups
/// stays consistent; every dequeued task is handed to its own spawned worker
/// and the loop never blocks on a gate or on execution. Concurrency is
/// bounded by the per-group gates alone, and only for leaves: a parent is a
/// coordinator, not work, so it gives its slot back before orchestrating
/// children. That rule is what keeps a subtree sharing the parent's group
/// from deadlocking.
pub struct Dispatcher {
    repo: Arc<dyn TaskRepository>,
    queue: Arc<GroupedTaskQueue>,
    gates: GroupGates,
    registry: Arc<ExecutorRegistry>,
    publisher: Arc<dyn EventPublisher>,
    aggregator: Arc<ProgressAggregator>,
    running: Arc<RunningTasks>,
    service: Arc<TaskService>,
    config: Arc<EngineConfig>,
    shutdown: CancelSignal,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        queue: Arc<GroupedTaskQueue>,
        registry: Arc<ExecutorRegistry>,
        publisher: Arc<dyn EventPublisher>,
        aggregator: Arc<ProgressAggregator>,
        running: Arc<RunningTasks>,
        service: Arc<TaskService>,
        config: Arc<EngineConfig>,
        shutdown: CancelSignal,
    ) -> Self {
        let gates = GroupGates::new(config.clone());
        Self {
            repo,
            queue,
            gates,
            registry,
            publisher,
            aggregator,
            running,
            service,
            config,
            shutdown,
        }
    }

    /// Dispatch loop. Runs until the shutdown signal trips.
    pub async fn run(self: Arc<Self>) {
        info!("dispatcher running");
        loop {
            let (task_id, group_id) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.queue.dequeue() => next,
            };
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.run_task(task_id, group_id).await;
            });
        }
        info!("dispatcher stopped");
    }

    async fn run_task(&self, task_id: Uuid, group_id: String) {
        let permit = match self.gates.acquire(&group_id).await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let task = match self.repo.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %task_id, "dequeued task no longer exists");
                return;
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "failed to load dequeued task");
                return;
            }
        };
        if task.state == TaskState::Cancelled {
            debug!(task_id = %task_id, "dequeued task already cancelled");
            return;
        }

        let child_count = self.repo.child_count(task_id).await.unwrap_or(0);
        if child_count > 0 {
            // Parents coordinate, they do not occupy a slot.
            drop(permit);
            self.run_parent(task).await;
        } else {
            self.run_leaf(task).await;
            drop(permit);
        }
    }

    // ---- leaf path ------------------------------------------------------

    async fn run_leaf(&self, task: TaskItem) {
        let id = task.id;
        let Some(executor) = self.registry.get(&task.task_type) else {
            warn!(task_id = %id, task_type = %task.task_type, "no executor registered");
            self.finish(
                id,
                TaskState::Errored,
                Some(format!("no executor for type {}", task.task_type)),
            )
            .await;
            return;
        };

        let signal = CancelSignal::new();
        self.running.register(id, signal.clone());

        let Some(task) = self.begin_executing(id).await else {
            self.running.unregister(&id);
            return;
        };

        let ctx = TaskContext::new(task, self.service.clone());
        let reporter = ProgressReporter::new(
            id,
            self.repo.clone(),
            self.publisher.clone(),
            self.aggregator.clone(),
            self.registry.clone(),
        );

        let outcome = tokio::select! {
            res = executor.execute(ctx, reporter, signal.clone()) => Some(res),
            _ = signal.cancelled() => None,
            _ = self.shutdown.cancelled() => {
                signal.cancel();
                None
            }
            _ = sleep(self.config.default_task_timeout) => {
                debug!(task_id = %id, "task timed out");
                signal.cancel();
                None
            }
        };

        match outcome {
            Some(Ok(())) => self.finish(id, TaskState::Completed, None).await,
            Some(Err(err)) => {
                warn!(task_id = %id, error = %err, "executor failed");
                self.finish(id, TaskState::Errored, Some(err.to_string()))
                    .await;
            }
            None => self.finish_interrupted(id).await,
        }

        self.running.unregister(&id);
    }

    // ---- parent path ----------------------------------------------------

    async fn run_parent(&self, task: TaskItem) {
        let id = task.id;
        let signal = CancelSignal::new();
        self.running.register(id, signal.clone());

        let Some(task) = self.begin_executing(id).await else {
            self.running.unregister(&id);
            return;
        };
        let executor = self.registry.get(&task.task_type);

        let outcome = tokio::select! {
            res = self.orchestrate(&task, executor.as_ref()) => Some(res),
            _ = signal.cancelled() => None,
            _ = self.shutdown.cancelled() => {
                signal.cancel();
                None
            }
            _ = sleep(self.config.default_task_timeout) => {
                debug!(task_id = %id, "parent task timed out");
                signal.cancel();
                None
            }
        };

        match outcome {
            Some(Ok((children, compensated))) => {
                let failed = children
                    .iter()
                    .filter(|c| c.state != TaskState::Completed && !compensated.contains(&c.id))
                    .count();
                if failed == 0 {
                    if children.iter().all(|c| c.state == TaskState::Completed) {
                        if let (Some(executor), Ok(Some(parent))) =
                            (&executor, self.repo.get(id).await)
                        {
                            executor.on_all_subtasks_success(&parent, &children).await;
                        }
                    }
                    self.finish(id, TaskState::Completed, None).await;
                } else {
                    self.finish(
                        id,
                        TaskState::Errored,
                        Some(format!(
                            "{failed} child task(s) did not complete successfully"
                        )),
                    )
                    .await;
                }
            }
            Some(Err(err)) => {
                warn!(task_id = %id, error = %err, "parent orchestration failed");
                self.finish(id, TaskState::Errored, Some(err.to_string()))
                    .await;
            }
            None => self.finish_interrupted(id).await,
        }

        self.running.unregister(&id);
    }

    /// Launch and watch the children of a parent until each one is terminal.
    /// Returns the final child snapshots plus the ids of failed children
    /// that a terminal hook compensated with replacement subtasks.
    async fn orchestrate(
        &self,
        parent: &TaskItem,
        executor: Option<&Arc<dyn TaskExecutor>>,
    ) -> Result<(Vec<TaskItem>, HashSet<Uuid>)> {
        let mut compensated = HashSet::new();
        if parent.subtask_parallelism {
            self.watch_parallel(parent, executor, &mut compensated)
                .await?;
        } else {
            self.watch_sequential(parent, executor, &mut compensated)
                .await?;
        }
        let children = self.repo.get_children(parent.id).await?;
        Ok((children, compensated))
    }

    /// Parallel mode: enqueue every child at once, then poll the set (which
    /// may grow) until all are terminal, firing hooks once per terminal
    /// transition.
    async fn watch_parallel(
        &self,
        parent: &TaskItem,
        executor: Option<&Arc<dyn TaskExecutor>>,
        compensated: &mut HashSet<Uuid>,
    ) -> Result<()> {
        let children = self.repo.get_children(parent.id).await?;
        for child in &children {
            self.launch_child(child);
        }

        let mut processed: HashSet<Uuid> = HashSet::new();
        loop {
            let children = self.repo.get_children(parent.id).await?;
            let mut all_terminal = true;
            let mut hooks_fired = false;

            for child in &children {
                if child.state.is_terminal() {
                    if processed.insert(child.id) {
                        self.fire_terminal_hooks(parent.id, child, executor, compensated)
                            .await?;
                        hooks_fired = true;
                    }
                } else {
                    all_terminal = false;
                }
            }

            // Hooks may have appended children; re-read before concluding.
            if all_terminal && !hooks_fired {
                return Ok(());
            }
            if !all_terminal {
                sleep(self.config.queue_poll_interval).await;
            }
        }
    }

    /// Sequential mode: one child at a time, in creation order. Terminal
    /// hooks fire before the next sibling launches, and subtasks returned by
    /// a hook run before the remaining siblings.
    async fn watch_sequential(
        &self,
        parent: &TaskItem,
        executor: Option<&Arc<dyn TaskExecutor>>,
        compensated: &mut HashSet<Uuid>,
    ) -> Result<()> {
        let mut worklist: Vec<Uuid> = self
            .repo
            .get_children(parent.id)
            .await?
            .iter()
            .map(|c| c.id)
            .collect();
        let mut idx = 0;

        loop {
            while idx < worklist.len() {
                let child_id = worklist[idx];
                let Some(mut child) = self.repo.get(child_id).await? else {
                    idx += 1;
                    continue;
                };

                if !child.state.is_terminal() {
                    self.launch_child(&child);
                    child = self.wait_for_terminal(child_id).await?;
                }

                let created = self
                    .fire_terminal_hooks(parent.id, &child, executor, compensated)
                    .await?;
                for (offset, new_child) in created.iter().enumerate() {
                    worklist.insert(idx + 1 + offset, new_child.id);
                }
                idx += 1;
            }

            // Pick up children attached externally while we were watching.
            let known: HashSet<Uuid> = worklist.iter().copied().collect();
            let late: Vec<Uuid> = self
                .repo
                .get_children(parent.id)
                .await?
                .iter()
                .map(|c| c.id)
                .filter(|id| !known.contains(id))
                .collect();
            if late.is_empty() {
                return Ok(());
            }
            worklist.extend(late);
        }
    }

    /// Enqueue a child that is queued in the store but not yet in the queue.
    /// Children created through `create` or `add_subtask` are enqueued at
    /// creation; hierarchy children wait for their parent to launch them.
    fn launch_child(&self, child: &TaskItem) {
        if child.state == TaskState::Queued && !self.queue.contains(child.id) {
            self.queue
                .enqueue(child.id, &child.group_id, child.priority);
        }
    }

    async fn wait_for_terminal(&self, child_id: Uuid) -> Result<TaskItem> {
        loop {
            match self.repo.get(child_id).await? {
                Some(child) if child.state.is_terminal() => return Ok(child),
                Some(_) => sleep(self.config.queue_poll_interval).await,
                None => {
                    return Err(crate::error::EngineError::not_found(child_id));
                }
            }
        }
    }

    /// Fire `on_subtask_state_change` then `on_subtask_terminal` for a child
    /// that reached a terminal state. Requests returned by the terminal hook
    /// are materialized via the service (which enqueues them) and the ids of
    /// non-completed children that got replacements are recorded as
    /// compensated.
    async fn fire_terminal_hooks(
        &self,
        parent_id: Uuid,
        child: &TaskItem,
        executor: Option<&Arc<dyn TaskExecutor>>,
        compensated: &mut HashSet<Uuid>,
    ) -> Result<Vec<TaskItem>> {
        let Some(executor) = executor else {
            return Ok(Vec::new());
        };
        let Some(parent) = self.repo.get(parent_id).await? else {
            return Ok(Vec::new());
        };

        let change = StateChange {
            state: child.state,
            details: child.state_details.clone(),
        };
        executor
            .on_subtask_state_change(&parent, child, &change)
            .await;
        let Some(reqs) = executor.on_subtask_terminal(&parent, child, &change).await else {
            return Ok(Vec::new());
        };
        if reqs.is_empty() {
            return Ok(Vec::new());
        }

        let created = self.service.add_subtasks(parent_id, reqs).await?;
        if child.state != TaskState::Completed {
            compensated.insert(child.id);
        }
        debug!(
            parent_id = %parent_id,
            child_id = %child.id,
            created = created.len(),
            "terminal hook appended subtasks"
        );
        Ok(created)
    }

    // ---- shared transitions ---------------------------------------------

    /// Move a still-queued task to `Executing`. The write is conditional on
    /// the stored state still being `Queued`, so a cancel that lands in the
    /// dispatch window wins and the `Executing` write is dropped. Returns
    /// `None` when the task vanished or left the queued state.
    async fn begin_executing(&self, id: Uuid) -> Option<TaskItem> {
        let mut task = match self.repo.get(id).await {
            Ok(Some(task)) => task,
            _ => return None,
        };
        if task.state != TaskState::Queued {
            debug!(task_id = %id, state = %task.state, "skipping dispatch");
            return None;
        }

        let now = Utc::now();
        task.state = TaskState::Executing;
        task.started_at = Some(now);
        task.updated_at = now;
        match self.repo.put_if_state(task.clone(), TaskState::Queued).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %id, "task left the queued state mid-dispatch");
                return None;
            }
            Err(err) => {
                warn!(task_id = %id, error = %err, "failed to mark task executing");
                return None;
            }
        }

        self.publisher
            .publish(TaskEvent::StateChanged {
                task_id: task.id,
                owner_id: task.owner_id.clone(),
                state: TaskState::Executing,
                details: None,
            })
            .await;
        Some(task)
    }

    /// Write a terminal state, unless the task already reached one. The
    /// write is conditional on the state it was derived from; a concurrent
    /// transition (an external cancel, usually) restarts the check, so
    /// terminal states stay absorbing.
    async fn finish(&self, id: Uuid, state: TaskState, details: Option<String>) {
        let task = loop {
            let current = match self.repo.get(id).await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "failed to load task for terminal write");
                    return;
                }
            };
            if current.state.is_terminal() {
                debug!(task_id = %id, state = %current.state, "already terminal, not overwriting");
                return;
            }

            let mut updated = current.clone();
            updated.state = state;
            updated.state_details = details.clone();
            updated.completed_at = Some(Utc::now());
            if state == TaskState::Completed {
                updated.progress = 100.0;
            }
            updated.touch();

            match self.repo.put_if_state(updated.clone(), current.state).await {
                Ok(true) => break updated,
                Ok(false) => continue,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "terminal write failed");
                    return;
                }
            }
        };

        self.publisher
            .publish(TaskEvent::StateChanged {
                task_id: task.id,
                owner_id: task.owner_id.clone(),
                state,
                details,
            })
            .await;
        self.aggregator.task_changed(&task).await;
        info!(task_id = %id, state = %state, "task finished");
    }

    /// The cancel signal tripped. An external cancel already wrote the
    /// `Cancelled` row and its event; everything else is a timeout or
    /// shutdown reclaim.
    async fn finish_interrupted(&self, id: Uuid) {
        match self.repo.get(id).await {
            Ok(Some(task)) if task.state == TaskState::Cancelled => {
                debug!(task_id = %id, "cancelled externally");
            }
            Ok(Some(_)) => {
                self.finish(
                    id,
                    TaskState::Terminated,
                    Some(TERMINATED_DETAILS.to_string()),
                )
                .await;
            }
            _ => {}
        }
    }
}
