use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

/// Entry in a group queue.
///
/// Ordered by priority descending, then enqueue sequence ascending, so equal
/// priorities are FIFO. The sequence counter is global across groups, which
/// makes cross-group ties deterministic as well. Equality matches the
/// ordering key exactly; sequences are unique, so two distinct entries never
/// compare equal.
#[derive(Debug, Clone)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    task_id: Uuid,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, earlier sequence breaks ties.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    /// One ordered queue per group, created lazily on first enqueue.
    groups: HashMap<String, BinaryHeap<QueueEntry>>,
    /// Sequences of entries retired before surfacing (cancelled or
    /// superseded by a re-enqueue); dropped when their entry reaches a head.
    tombstones: HashSet<u64>,
    /// Sequence of the current live entry per queued id.
    live: HashMap<Uuid, u64>,
    seq: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            groups: HashMap::new(),
            tombstones: HashSet::new(),
            live: HashMap::new(),
            seq: 0,
        }
    }

    /// Pop tombstoned entries off a group's head so `peek` sees a live task.
    fn skim_tombstones(&mut self, group: &str) {
        if let Some(heap) = self.groups.get_mut(group) {
            while let Some(head) = heap.peek() {
                if self.tombstones.remove(&head.seq) {
                    heap.pop();
                } else {
                    break;
                }
            }
        }
    }

    /// Select the globally best entry across all non-empty groups.
    fn pop_best(&mut self) -> Option<(Uuid, String)> {
        let group_names: Vec<String> = self.groups.keys().cloned().collect();
        for name in &group_names {
            self.skim_tombstones(name);
        }

        let best_group = self
            .groups
            .iter()
            .filter_map(|(name, heap)| heap.peek().map(|entry| (name, entry)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(name, _)| name.clone())?;

        let entry = self
            .groups
            .get_mut(&best_group)
            .and_then(|heap| heap.pop())?;
        self.live.remove(&entry.task_id);
        Some((entry.task_id, best_group))
    }
}

/// Priority queue with per-group ordering and fair cross-group selection.
///
/// Stores task ids only; task rows stay in the repository. A single global
/// dequeue picks the highest-priority task across every group, ties broken
/// by earliest enqueue, which keeps same-priority tasks starvation-free.
pub struct GroupedTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl GroupedTaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
        }
    }

    /// Add a task to its group queue. Re-enqueueing an id that is already
    /// queued retires the old entry, so a priority re-key leaves exactly one
    /// live entry behind.
    pub fn enqueue(&self, task_id: Uuid, group_id: &str, priority: i32) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let seq = state.seq;
            state.seq += 1;
            if let Some(old_seq) = state.live.insert(task_id, seq) {
                state.tombstones.insert(old_seq);
            }
            state
                .groups
                .entry(group_id.to_string())
                .or_default()
                .push(QueueEntry {
                    priority,
                    seq,
                    task_id,
                });
            trace!(task_id = %task_id, group = group_id, priority, seq, "enqueued");
        }
        self.notify.notify_one();
    }

    /// Take the globally best queued task, blocking while every group queue
    /// is empty. Cancellation of the caller (dropping the future) is safe:
    /// nothing is popped until a task is actually returned.
    pub async fn dequeue(&self) -> (Uuid, String) {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some((task_id, group)) = state.pop_best() {
                    debug!(task_id = %task_id, group = %group, "dequeued");
                    return (task_id, group);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a queued id cancelled so it is skipped on dequeue. Returns
    /// whether the id was actually queued.
    pub fn try_cancel(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if let Some(seq) = state.live.remove(&task_id) {
            state.tombstones.insert(seq);
            debug!(task_id = %task_id, seq, "tombstoned queued task");
            true
        } else {
            false
        }
    }

    /// Whether an id is currently queued and not tombstoned.
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .live
            .contains_key(&task_id)
    }

    /// Number of live (non-tombstoned) queued tasks.
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GroupedTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
