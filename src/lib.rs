//! # Conveyor: Typed Task Execution Engine
//!
//! A task execution engine that accepts typed work items, queues them by
//! priority under per-group concurrency caps, runs them on pluggable
//! executors, aggregates progress across parent/child hierarchies, and
//! streams state and progress events to subscribers in real time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conveyor::{CreateTaskRequest, TaskEngine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = TaskEngine::builder()
//!         // .register_executor(Arc::new(MyExecutor))
//!         .build()?;
//!
//!     let task = engine
//!         .service()
//!         .create("alice", CreateTaskRequest::new("my-type", json!({})), None)
//!         .await?;
//!     println!("queued {}", task.id);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod gate;
pub mod model;
pub mod progress;
pub mod queue;
pub mod repository;
pub mod service;

pub use cancel::CancelSignal;
pub use config::{EngineConfig, EngineConfigBuilder, GroupConfig};
pub use error::{EngineError, Result};
pub use events::{BroadcastEventPublisher, EventPublisher, NoopEventPublisher, TaskEvent};
pub use executor::{ExecutorRegistry, ProgressReporter, TaskContext, TaskExecutor};
pub use model::{
    CreateTaskRequest, ProgressUpdate, StateChange, TaskItem, TaskState, TaskTree,
    UpdateTaskRequest, DEFAULT_GROUP,
};
pub use progress::ProgressAggregator;
pub use repository::{InMemoryTaskRepository, TaskRepository};
pub use service::TaskService;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use cancel::RunningTasks;
use dispatcher::Dispatcher;
use queue::GroupedTaskQueue;

/// The assembled engine: repository, queue, gates, dispatcher and service.
///
/// Built through [`TaskEngine::builder`]; the dispatch loop is spawned at
/// build time, so construction must happen inside a Tokio runtime.
pub struct TaskEngine {
    service: Arc<TaskService>,
    registry: Arc<ExecutorRegistry>,
    broadcast: Option<Arc<BroadcastEventPublisher>>,
    config: Arc<EngineConfig>,
    shutdown: CancelSignal,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn builder() -> TaskEngineBuilder {
        TaskEngineBuilder::new()
    }

    /// Operation surface: create, cancel, delete, subtask management.
    pub fn service(&self) -> &Arc<TaskService> {
        &self.service
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an executor after construction. Useful for executors that
    /// need the service handle, which only exists once the engine is built.
    pub fn register_executor(&self, executor: Arc<dyn TaskExecutor>) {
        self.registry.register(executor);
    }

    /// Subscribe to the engine's event stream. Returns `None` when a custom
    /// publisher replaced the built-in broadcast one.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<TaskEvent>> {
        self.broadcast.as_ref().map(|p| p.subscribe())
    }

    /// Stop the dispatch loop and reclaim running tasks. Tasks still
    /// executing observe the shutdown through their cancel signals and
    /// terminate.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.shutdown.cancel();
        if let Some(handle) = self.dispatcher_handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        info!("engine shutdown complete");
    }
}

/// Builder for [`TaskEngine`].
pub struct TaskEngineBuilder {
    config: EngineConfig,
    repo: Option<Arc<dyn TaskRepository>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    executors: Vec<Arc<dyn TaskExecutor>>,
}

impl TaskEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            repo: None,
            publisher: None,
            executors: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap the in-memory reference repository for another backend.
    pub fn with_repository(mut self, repo: Arc<dyn TaskRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Replace the built-in broadcast publisher. Doing so disables
    /// [`TaskEngine::subscribe`].
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn register_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Assemble the engine and spawn its dispatch loop. Must be called from
    /// within a Tokio runtime.
    pub fn build(self) -> Result<Arc<TaskEngine>> {
        self.config
            .validate()
            .map_err(EngineError::InvalidRequest)?;
        let config = Arc::new(self.config);

        let repo = self
            .repo
            .unwrap_or_else(|| Arc::new(InMemoryTaskRepository::new()));
        let (publisher, broadcast_handle): (Arc<dyn EventPublisher>, _) = match self.publisher {
            Some(publisher) => (publisher, None),
            None => {
                let broadcast = Arc::new(BroadcastEventPublisher::new(config.event_buffer));
                (broadcast.clone() as Arc<dyn EventPublisher>, Some(broadcast))
            }
        };

        let queue = Arc::new(GroupedTaskQueue::new());
        let registry = Arc::new(ExecutorRegistry::new());
        for executor in self.executors {
            registry.register(executor);
        }
        let aggregator = Arc::new(ProgressAggregator::new(repo.clone(), publisher.clone()));
        let running = Arc::new(RunningTasks::new());
        let service = Arc::new(TaskService::new(
            repo.clone(),
            queue.clone(),
            publisher.clone(),
            aggregator.clone(),
            running.clone(),
        ));

        let shutdown = CancelSignal::new();
        let dispatcher = Arc::new(Dispatcher::new(
            repo,
            queue,
            registry.clone(),
            publisher,
            aggregator,
            running,
            service.clone(),
            config.clone(),
            shutdown.clone(),
        ));
        let handle = tokio::spawn(dispatcher.run());
        info!("engine started");

        Ok(Arc::new(TaskEngine {
            service,
            registry,
            broadcast: broadcast_handle,
            config,
            shutdown,
            dispatcher_handle: Mutex::new(Some(handle)),
        }))
    }
}

impl Default for TaskEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
