use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-group concurrency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Maximum number of leaf tasks executing at once in this group.
    pub max_parallelism: usize,
}

/// Engine configuration with all tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-task execution timeout; elapsed tasks terminate with a distinct
    /// terminal state rather than an external-cancel one.
    pub default_task_timeout: Duration,
    /// Cadence of the parent watch loop over its children.
    pub queue_poll_interval: Duration,
    /// Concurrency cap applied to groups without an explicit entry.
    pub default_group_parallelism: usize,
    /// Explicitly configured groups, keyed by group id.
    pub groups: HashMap<String, GroupConfig>,
    /// Capacity of the broadcast channel behind the default event publisher.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout: Duration::from_secs(60 * 60),
            queue_poll_interval: Duration::from_millis(100),
            default_group_parallelism: 32,
            groups: HashMap::new(),
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Parallelism cap for a group, falling back to the default cap for
    /// groups that were never configured. The well-known default group is
    /// just another fallback consumer.
    pub fn group_parallelism(&self, group_id: &str) -> usize {
        self.groups
            .get(group_id)
            .map(|g| g.max_parallelism)
            .unwrap_or(self.default_group_parallelism)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_group_parallelism == 0 {
            return Err("default_group_parallelism must be greater than 0".to_string());
        }
        if self.default_task_timeout.is_zero() {
            return Err("default_task_timeout must be greater than 0".to_string());
        }
        if self.queue_poll_interval.is_zero() {
            return Err("queue_poll_interval must be greater than 0".to_string());
        }
        if self.event_buffer == 0 {
            return Err("event_buffer must be greater than 0".to_string());
        }
        for (id, group) in &self.groups {
            if group.max_parallelism == 0 {
                return Err(format!("group {id}: max_parallelism must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Configuration tuned for tests: bounded timeout, fast watch loop.
    pub fn testing() -> Self {
        Self {
            default_task_timeout: Duration::from_secs(30),
            queue_poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }
}

/// Builder for [`EngineConfig`].
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_task_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.queue_poll_interval = interval;
        self
    }

    pub fn default_parallelism(mut self, max: usize) -> Self {
        self.config.default_group_parallelism = max;
        self
    }

    pub fn group(mut self, id: impl Into<String>, max_parallelism: usize) -> Self {
        self.config
            .groups
            .insert(id.into(), GroupConfig { max_parallelism });
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    pub fn build(self) -> Result<EngineConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
