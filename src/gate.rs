use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Per-group concurrency gates.
///
/// Each group maps to a counting semaphore sized by its configured
/// parallelism, created lazily the first time the group is dispatched. Leaf
/// workers hold a permit for the whole execution; parent workers release
/// theirs before orchestrating children so a subtree sharing the parent's
/// group can never deadlock on it.
pub struct GroupGates {
    gates: DashMap<String, Arc<Semaphore>>,
    config: Arc<EngineConfig>,
}

impl GroupGates {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            gates: DashMap::new(),
            config,
        }
    }

    fn gate(&self, group_id: &str) -> Arc<Semaphore> {
        self.gates
            .entry(group_id.to_string())
            .or_insert_with(|| {
                let cap = self.config.group_parallelism(group_id);
                debug!(group = group_id, cap, "creating group gate");
                Arc::new(Semaphore::new(cap))
            })
            .clone()
    }

    /// Wait for a slot in the group's pool.
    pub async fn acquire(&self, group_id: &str) -> Result<OwnedSemaphorePermit> {
        let gate = self.gate(group_id);
        gate.acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    /// Free slots currently available in a group. Groups never dispatched
    /// report their configured capacity.
    pub fn available(&self, group_id: &str) -> usize {
        self.gates
            .get(group_id)
            .map(|g| g.available_permits())
            .unwrap_or_else(|| self.config.group_parallelism(group_id))
    }
}
