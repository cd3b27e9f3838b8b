//! Concurrency-facing engine behavior: group caps, gate release for
//! parents, sequential launch order, dynamic subtask pickup and shutdown
//! reclamation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use conveyor::{
    CancelSignal, CreateTaskRequest, EngineConfig, ProgressReporter, TaskContext, TaskEngine,
    TaskExecutor, TaskItem, TaskService, TaskState, TaskTree,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use uuid::Uuid;

const OWNER: &str = "alice";

async fn wait_for_state(service: &TaskService, id: Uuid, state: TaskState) -> TaskItem {
    for _ in 0..1000 {
        if let Some(task) = service.get(id, OWNER).await.unwrap() {
            if task.state == state {
                return task;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached {state:?}");
}

/// Tracks how many executions overlap, and the high-water mark.
struct TrackingExecutor {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskExecutor for TrackingExecutor {
    fn task_type(&self) -> &str {
        "tracked"
    }

    async fn execute(
        &self,
        _ctx: TaskContext,
        _progress: ProgressReporter,
        _cancel: CancelSignal,
    ) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn group_cap_bounds_concurrent_leaves() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let config = EngineConfig::builder()
        .task_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(20))
        .group("narrow", 2)
        .build()
        .unwrap();
    let engine = TaskEngine::builder()
        .with_config(config)
        .register_executor(Arc::new(TrackingExecutor {
            current: current.clone(),
            peak: peak.clone(),
        }))
        .build()
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..6 {
        let task = engine
            .service()
            .create(
                OWNER,
                CreateTaskRequest::new("tracked", json!({})).group("narrow"),
                None,
            )
            .await
            .unwrap();
        ids.push(task.id);
    }

    for id in ids {
        wait_for_state(engine.service(), id, TaskState::Completed).await;
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "cap exceeded: {peak:?}");

    engine.shutdown().await;
}

struct InstantExecutor;

#[async_trait]
impl TaskExecutor for InstantExecutor {
    fn task_type(&self) -> &str {
        "instant"
    }

    async fn execute(
        &self,
        _ctx: TaskContext,
        _progress: ProgressReporter,
        _cancel: CancelSignal,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn parent_sharing_its_group_with_children_completes() {
    // Cap of 1: if the parent held its slot while orchestrating, its own
    // children could never run.
    let config = EngineConfig::builder()
        .task_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(20))
        .group("solo", 1)
        .build()
        .unwrap();
    let engine = TaskEngine::builder()
        .with_config(config)
        .register_executor(Arc::new(InstantExecutor))
        .build()
        .unwrap();

    let tree = TaskTree::new(
        CreateTaskRequest::new("fanout", json!({}))
            .group("solo")
            .parallel_subtasks(true),
    )
    .child(TaskTree::new(
        CreateTaskRequest::new("instant", json!({})).group("solo"),
    ))
    .child(TaskTree::new(
        CreateTaskRequest::new("instant", json!({})).group("solo"),
    ));

    let root = engine
        .service()
        .create_hierarchy(OWNER, tree, None)
        .await
        .unwrap();
    let done = wait_for_state(engine.service(), root.id, TaskState::Completed).await;
    assert_eq!(done.progress, 100.0);

    engine.shutdown().await;
}

/// Records the label from each payload in execution order.
struct OrderExecutor {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TaskExecutor for OrderExecutor {
    fn task_type(&self) -> &str {
        "ordered"
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        _progress: ProgressReporter,
        _cancel: CancelSignal,
    ) -> anyhow::Result<()> {
        let label = ctx
            .payload()
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        self.order.lock().unwrap().push(label);
        Ok(())
    }
}

#[tokio::test]
async fn sequential_parent_launches_children_in_creation_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let engine = TaskEngine::builder()
        .with_config(EngineConfig::testing())
        .register_executor(Arc::new(OrderExecutor {
            order: order.clone(),
        }))
        .build()
        .unwrap();

    let tree = TaskTree::new(CreateTaskRequest::new("chain", json!({})))
        .child(TaskTree::new(CreateTaskRequest::new(
            "ordered",
            json!({"label": "first"}),
        )))
        .child(TaskTree::new(CreateTaskRequest::new(
            "ordered",
            json!({"label": "second"}),
        )))
        .child(TaskTree::new(CreateTaskRequest::new(
            "ordered",
            json!({"label": "third"}),
        )));

    let root = engine
        .service()
        .create_hierarchy(OWNER, tree, None)
        .await
        .unwrap();
    wait_for_state(engine.service(), root.id, TaskState::Completed).await;

    assert_eq!(
        *order.lock().unwrap(),
        vec!["first".to_string(), "second".to_string(), "third".to_string()]
    );

    engine.shutdown().await;
}

/// Waits on a named gate; used to pin tasks in the executing state.
struct GatedExecutor {
    gates: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl GatedExecutor {
    fn new() -> (Self, Arc<DashMap<String, Arc<Semaphore>>>) {
        let gates: Arc<DashMap<String, Arc<Semaphore>>> = Arc::new(DashMap::new());
        (
            Self {
                gates: gates.clone(),
            },
            gates,
        )
    }

    fn gate(gates: &DashMap<String, Arc<Semaphore>>, key: &str) -> Arc<Semaphore> {
        gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    fn task_type(&self) -> &str {
        "gated"
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        _progress: ProgressReporter,
        cancel: CancelSignal,
    ) -> anyhow::Result<()> {
        let key = ctx
            .payload()
            .get("gate")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let gate = Self::gate(&self.gates, &key);
        tokio::select! {
            permit = gate.acquire() => {
                permit.expect("gate closed").forget();
                Ok(())
            }
            _ = cancel.cancelled() => Err(anyhow!("cancelled")),
        }
    }
}

#[tokio::test]
async fn externally_added_subtask_joins_the_watch_loop() {
    let (executor, gates) = GatedExecutor::new();
    let engine = TaskEngine::builder()
        .with_config(EngineConfig::testing())
        .register_executor(Arc::new(executor))
        .build()
        .unwrap();

    let tree = TaskTree::new(
        CreateTaskRequest::new("fanout", json!({})).parallel_subtasks(true),
    )
    .child(TaskTree::new(CreateTaskRequest::new(
        "gated",
        json!({"gate": "g1"}),
    )));
    let root = engine
        .service()
        .create_hierarchy(OWNER, tree, None)
        .await
        .unwrap();

    let first = engine.service().children(root.id, OWNER).await.unwrap()[0].id;
    wait_for_state(engine.service(), first, TaskState::Executing).await;

    let second = engine
        .service()
        .add_subtask(root.id, CreateTaskRequest::new("gated", json!({"gate": "g2"})))
        .await
        .unwrap();

    GatedExecutor::gate(&gates, "g1").add_permits(1);
    wait_for_state(engine.service(), first, TaskState::Completed).await;

    // The parent keeps watching: the late child still blocks completion.
    sleep(Duration::from_millis(100)).await;
    let root_mid = engine.service().get(root.id, OWNER).await.unwrap().unwrap();
    assert_eq!(root_mid.state, TaskState::Executing);

    GatedExecutor::gate(&gates, "g2").add_permits(1);
    wait_for_state(engine.service(), second.id, TaskState::Completed).await;
    wait_for_state(engine.service(), root.id, TaskState::Completed).await;
    assert_eq!(
        engine.service().children(root.id, OWNER).await.unwrap().len(),
        2
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_reclaims_running_tasks() {
    let (executor, _gates) = GatedExecutor::new();
    let engine = TaskEngine::builder()
        .with_config(EngineConfig::testing())
        .register_executor(Arc::new(executor))
        .build()
        .unwrap();

    let task = engine
        .service()
        .create(
            OWNER,
            CreateTaskRequest::new("gated", json!({"gate": "never"})),
            None,
        )
        .await
        .unwrap();
    wait_for_state(engine.service(), task.id, TaskState::Executing).await;

    engine.shutdown().await;

    let dead = wait_for_state(engine.service(), task.id, TaskState::Terminated).await;
    assert_eq!(dead.state_details.as_deref(), Some("timed out or terminated"));
}
