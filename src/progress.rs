use std::sync::Arc;

use tracing::{trace, warn};

use crate::events::{EventPublisher, TaskEvent};
use crate::model::{TaskItem, TaskState};
use crate::repository::TaskRepository;

/// Rolls child progress up to ancestors.
///
/// A parent's progress is always the weighted average of its immediate
/// children, recomputed on every child progress report and on every child
/// terminal transition, then bubbled up the tree. The tree invariant bounds
/// the walk by depth, so it is iterative rather than recursive.
pub struct ProgressAggregator {
    repo: Arc<dyn TaskRepository>,
    publisher: Arc<dyn EventPublisher>,
}

impl ProgressAggregator {
    pub fn new(repo: Arc<dyn TaskRepository>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { repo, publisher }
    }

    /// Details marker attached to aggregated parent progress so consumers
    /// can tell it apart from leaf progress.
    pub fn aggregated_marker(child_count: usize) -> String {
        format!("Aggregated from {child_count} children")
    }

    /// Recompute ancestors of a task whose progress or state changed.
    pub async fn task_changed(&self, task: &TaskItem) {
        let mut parent_id = task.parent_task_id;

        while let Some(id) = parent_id {
            let mut parent = match self.repo.get(id).await {
                Ok(Some(parent)) => parent,
                Ok(None) => return,
                Err(err) => {
                    warn!(parent_id = %id, error = %err, "failed to load parent for aggregation");
                    return;
                }
            };

            let children = match self.repo.get_children(id).await {
                Ok(children) => children,
                Err(err) => {
                    warn!(parent_id = %id, error = %err, "failed to load children for aggregation");
                    return;
                }
            };
            if children.is_empty() {
                return;
            }

            let progress = Self::weighted_progress(&children);
            let details = Self::aggregated_marker(children.len());
            trace!(parent_id = %id, progress, "aggregated parent progress");

            let prior_state = parent.state;
            parent.progress = progress;
            parent.progress_details = Some(details.clone());
            parent.progress_payload = None;
            parent.touch();
            let owner = parent.owner_id.clone();
            let next = parent.parent_task_id;

            // Conditional on the parent state the roll-up was derived from;
            // a parent transitioning concurrently re-aggregates on its own
            // terminal write, so a lost race is dropped here.
            match self.repo.put_if_state(parent, prior_state).await {
                Ok(true) => {}
                Ok(false) => {
                    trace!(parent_id = %id, "aggregation lost a state race, dropped");
                    return;
                }
                Err(err) => {
                    warn!(parent_id = %id, error = %err, "failed to write aggregated progress");
                    return;
                }
            }

            self.publisher
                .publish(TaskEvent::Progress {
                    task_id: id,
                    owner_id: owner,
                    percentage: progress,
                    details: Some(details),
                    payload: None,
                })
                .await;

            parent_id = next;
        }
    }

    /// Weighted average over immediate children. A completed child counts as
    /// 100 regardless of its last report; any other terminal child keeps its
    /// progress-at-failure.
    fn weighted_progress(children: &[TaskItem]) -> f64 {
        let total_weight: f64 = children.iter().map(|c| c.weight).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        children
            .iter()
            .map(|c| {
                let contribution = if c.state == TaskState::Completed {
                    100.0
                } else {
                    c.progress
                };
                (c.weight / total_weight) * contribution
            })
            .sum()
    }
}
