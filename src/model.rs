use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known group every task falls into unless it names another one.
pub const DEFAULT_GROUP: &str = "default";

/// Task lifecycle states.
///
/// `Completed`, `Cancelled`, `Errored` and `Terminated` are terminal and
/// absorbing: once a task enters one of them it never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Executing,
    Completed,
    Cancelled,
    Errored,
    Terminated,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Errored | TaskState::Terminated
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "Queued",
            TaskState::Executing => "Executing",
            TaskState::Completed => "Completed",
            TaskState::Cancelled => "Cancelled",
            TaskState::Errored => "Errored",
            TaskState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// One node in the task tree.
///
/// Tasks are flat rows linked by `parent_task_id`; `root_task_id` is constant
/// for the life of the task and equals `id` for roots. A task with a parent
/// shares the parent's `owner_id`, `root_task_id`, `auth_token` and
/// `track_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: Uuid,
    pub owner_id: String,
    pub group_id: String,
    pub priority: i32,
    pub task_type: String,
    pub payload: Value,
    pub output: Option<Bytes>,
    pub state: TaskState,
    /// Percentage in `[0, 100]`. For parents this is derived from children
    /// and never written by an executor.
    pub progress: f64,
    pub progress_details: Option<String>,
    pub progress_payload: Option<Value>,
    pub state_details: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub root_task_id: Uuid,
    /// Positive weight contributing to parent progress aggregation.
    pub weight: f64,
    /// Parent-only: launch children all at once instead of one at a time.
    pub subtask_parallelism: bool,
    pub track_history: bool,
    pub auth_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskItem {
    /// Build a root task from a creation request.
    pub fn from_request(owner: &str, req: &CreateTaskRequest, auth_token: Option<String>) -> Self {
        let now = Utc::now();
        let id = req.id.unwrap_or_else(Uuid::new_v4);
        Self {
            id,
            owner_id: owner.to_string(),
            group_id: req
                .group_id
                .clone()
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            priority: req.priority,
            task_type: req.task_type.clone(),
            payload: req.payload.clone(),
            output: None,
            state: TaskState::Queued,
            progress: 0.0,
            progress_details: None,
            progress_payload: None,
            state_details: None,
            parent_task_id: None,
            root_task_id: id,
            weight: req.weight.unwrap_or(1.0),
            subtask_parallelism: req.subtask_parallelism.unwrap_or(false),
            track_history: req.track_history.unwrap_or(false),
            auth_token,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Build a child task, inheriting the fields that flow top-down at
    /// creation time: owner, root, auth token, history tracking, and the
    /// group when the request names none.
    pub fn child_of(parent: &TaskItem, req: &CreateTaskRequest) -> Self {
        let mut task = Self::from_request(&parent.owner_id, req, parent.auth_token.clone());
        task.parent_task_id = Some(parent.id);
        task.root_task_id = parent.root_task_id;
        task.track_history = parent.track_history;
        if req.group_id.is_none() {
            task.group_id = parent.group_id.clone();
        }
        task
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Request to create a single task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    /// Explicit id; generated when absent.
    pub id: Option<Uuid>,
    pub priority: i32,
    pub task_type: String,
    pub payload: Value,
    pub group_id: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub weight: Option<f64>,
    pub subtask_parallelism: Option<bool>,
    pub track_history: Option<bool>,
}

impl CreateTaskRequest {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn parallel_subtasks(mut self, parallel: bool) -> Self {
        self.subtask_parallelism = Some(parallel);
        self
    }
}

/// A hierarchy of tasks materialized atomically; only the root is enqueued,
/// children are launched by the parent's orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTree {
    pub task: CreateTaskRequest,
    #[serde(default)]
    pub children: Vec<TaskTree>,
}

impl TaskTree {
    pub fn new(task: CreateTaskRequest) -> Self {
        Self {
            task,
            children: Vec::new(),
        }
    }

    pub fn child(mut self, child: TaskTree) -> Self {
        self.children.push(child);
        self
    }

    /// Total number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TaskTree::node_count).sum::<usize>()
    }
}

/// Mutable fields of a queued task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    pub priority: Option<i32>,
    pub payload: Option<Value>,
}

/// One progress report from an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percentage: f64,
    pub details: Option<String>,
    pub payload: Option<Value>,
}

/// A state transition as observed by hooks and event consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub state: TaskState,
    pub details: Option<String>,
}
