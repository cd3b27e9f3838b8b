use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{TaskItem, TaskState};

/// Storage contract for task rows.
///
/// `put` is last-writer-wins per id. Implementations must be safe under many
/// concurrent readers and writers; the dispatcher guarantees that a single
/// worker owns the read-modify-write cycle of a task while it executes.
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    async fn get(&self, id: Uuid) -> Result<Option<TaskItem>>;

    async fn put(&self, task: TaskItem) -> Result<()>;

    /// Write a task only while its stored state still matches `expected`.
    /// Returns whether the write happened. State-carrying writes go through
    /// this guard so a task cancelled mid-transition is never resurrected by
    /// a stale read-modify-write.
    async fn put_if_state(&self, task: TaskItem, expected: TaskState) -> Result<bool>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// All tasks of an owner, newest first.
    async fn get_by_owner(&self, owner: &str) -> Result<Vec<TaskItem>>;

    /// Immediate children in creation order.
    async fn get_children(&self, parent: Uuid) -> Result<Vec<TaskItem>>;

    /// All transitive children in breadth-first order, excluding the root.
    async fn get_descendants(&self, root: Uuid) -> Result<Vec<TaskItem>>;

    async fn child_count(&self, parent: Uuid) -> Result<usize>;

    /// Insert a set of tasks, all or none.
    async fn add_batch(&self, tasks: Vec<TaskItem>) -> Result<()>;

    /// Remove a task and every descendant, leaves first. Returns the removed
    /// ids in deletion order.
    async fn delete_subtree(&self, root: Uuid) -> Result<Vec<Uuid>>;
}

/// Reference in-memory repository.
///
/// A flat task map plus secondary indexes; the child index keeps insertion
/// order because sequential parents launch children in creation order.
pub struct InMemoryTaskRepository {
    tasks: DashMap<Uuid, TaskItem>,
    by_owner: DashMap<String, DashSet<Uuid>>,
    children: DashMap<Uuid, Vec<Uuid>>,
    batch_lock: Mutex<()>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            by_owner: DashMap::new(),
            children: DashMap::new(),
            batch_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn index_insert(&self, task: &TaskItem) {
        self.by_owner
            .entry(task.owner_id.clone())
            .or_default()
            .insert(task.id);
        if let Some(parent) = task.parent_task_id {
            let mut siblings = self.children.entry(parent).or_default();
            if !siblings.contains(&task.id) {
                siblings.push(task.id);
            }
        }
    }

    fn index_remove(&self, task: &TaskItem) {
        if let Some(owned) = self.by_owner.get(&task.owner_id) {
            owned.remove(&task.id);
        }
        if let Some(parent) = task.parent_task_id {
            if let Some(mut siblings) = self.children.get_mut(&parent) {
                siblings.retain(|id| *id != task.id);
            }
        }
        self.children.remove(&task.id);
    }

    /// Breadth-first ids of the subtree below `root`, excluding `root`.
    fn descendant_ids(&self, root: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut frontier = VecDeque::from([root]);
        while let Some(id) = frontier.pop_front() {
            if let Some(child_ids) = self.children.get(&id) {
                for child in child_ids.iter() {
                    out.push(*child);
                    frontier.push_back(*child);
                }
            }
        }
        out
    }
}

impl Default for InMemoryTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get(&self, id: Uuid) -> Result<Option<TaskItem>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn put(&self, task: TaskItem) -> Result<()> {
        self.index_insert(&task);
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn put_if_state(&self, task: TaskItem, expected: TaskState) -> Result<bool> {
        // The entry guard makes the compare and the write one atomic step.
        match self.tasks.get_mut(&task.id) {
            Some(mut current) if current.state == expected => {
                *current = task;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if let Some((_, task)) = self.tasks.remove(&id) {
            self.index_remove(&task);
        }
        Ok(())
    }

    async fn get_by_owner(&self, owner: &str) -> Result<Vec<TaskItem>> {
        let mut tasks: Vec<TaskItem> = match self.by_owner.get(owner) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.tasks.get(&id).map(|t| t.clone()))
                .collect(),
            None => Vec::new(),
        };
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }

    async fn get_children(&self, parent: Uuid) -> Result<Vec<TaskItem>> {
        let ids: Vec<Uuid> = self
            .children
            .get(&parent)
            .map(|c| c.clone())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.tasks.get(&id).map(|t| t.clone()))
            .collect())
    }

    async fn get_descendants(&self, root: Uuid) -> Result<Vec<TaskItem>> {
        Ok(self
            .descendant_ids(root)
            .into_iter()
            .filter_map(|id| self.tasks.get(&id).map(|t| t.clone()))
            .collect())
    }

    async fn child_count(&self, parent: Uuid) -> Result<usize> {
        Ok(self.children.get(&parent).map(|c| c.len()).unwrap_or(0))
    }

    async fn add_batch(&self, tasks: Vec<TaskItem>) -> Result<()> {
        let _guard = self
            .batch_lock
            .lock()
            .map_err(|_| EngineError::repository("batch lock poisoned"))?;

        let mut seen = std::collections::HashSet::new();
        for task in &tasks {
            if self.tasks.contains_key(&task.id) {
                return Err(EngineError::invalid_request(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            if !seen.insert(task.id) {
                return Err(EngineError::invalid_request(format!(
                    "duplicate task id {} in batch",
                    task.id
                )));
            }
        }

        debug!(count = tasks.len(), "inserting task batch");
        for task in tasks {
            self.index_insert(&task);
            self.tasks.insert(task.id, task);
        }
        Ok(())
    }

    async fn delete_subtree(&self, root: Uuid) -> Result<Vec<Uuid>> {
        let mut order = self.descendant_ids(root);
        order.push(root);
        // Reverse breadth-first: deepest nodes go first.
        order.reverse();

        let mut removed = Vec::with_capacity(order.len());
        for id in order {
            if let Some((_, task)) = self.tasks.remove(&id) {
                self.index_remove(&task);
                removed.push(id);
            }
        }
        debug!(root = %root, count = removed.len(), "deleted subtree");
        Ok(removed)
    }
}
