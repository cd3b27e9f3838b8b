use thiserror::Error;
use uuid::Uuid;

use crate::model::TaskState;

/// Engine errors surfaced through the task service and dispatcher.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: Uuid },

    #[error("Task {task_id} belongs to another owner")]
    Forbidden { task_id: Uuid },

    #[error("Cannot {operation} task {task_id} in state {state}")]
    InvalidState {
        task_id: Uuid,
        state: TaskState,
        operation: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Executor failed for task {task_id}: {reason}")]
    ExecutorFailure { task_id: Uuid, reason: String },

    #[error("Task {task_id} timed out")]
    Timeout { task_id: Uuid },

    #[error("Task {task_id} was cancelled")]
    Cancelled { task_id: Uuid },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Engine is shutting down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(task_id: Uuid) -> Self {
        Self::TaskNotFound { task_id }
    }

    pub fn forbidden(task_id: Uuid) -> Self {
        Self::Forbidden { task_id }
    }

    pub fn invalid_state(task_id: Uuid, state: TaskState, operation: &'static str) -> Self {
        Self::InvalidState {
            task_id,
            state,
            operation,
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    /// Whether the operation may be retried without any caller-side change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Repository(_) | Self::Timeout { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
