use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

/// A one-shot cancellation signal shared between the dispatcher, the task
/// service and the executor running a task.
///
/// The signal trips on engine shutdown, on an explicit cancel for the task,
/// or on the per-task timeout. Executors should observe it between units of
/// work; the dispatcher also races it against `execute` so a blocked executor
/// can be reclaimed.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the signal has tripped. Re-checks the flag around the
    /// notification so a cancel racing the registration is never missed.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancellation signals of currently dispatched tasks, keyed by task id.
///
/// Owned jointly by the dispatcher (register/unregister) and the task
/// service (fire on external cancel).
#[derive(Default)]
pub struct RunningTasks {
    signals: DashMap<Uuid, CancelSignal>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: Uuid, signal: CancelSignal) {
        self.signals.insert(task_id, signal);
    }

    pub fn unregister(&self, task_id: &Uuid) {
        self.signals.remove(task_id);
    }

    /// Fire the signal for a running task. Returns whether one was registered.
    pub fn cancel(&self, task_id: &Uuid) -> bool {
        match self.signals.get(task_id) {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_trips_once() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        signal.cancel();
        assert!(signal.is_cancelled());

        // Already tripped: resolves immediately.
        tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .expect("cancelled() should resolve after cancel()");
    }

    #[tokio::test]
    async fn waiter_wakes_on_cancel() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn running_tasks_cancel_by_id() {
        let running = RunningTasks::new();
        let id = Uuid::new_v4();
        let signal = CancelSignal::new();
        running.register(id, signal.clone());

        assert!(running.cancel(&id));
        assert!(signal.is_cancelled());

        running.unregister(&id);
        assert!(!running.cancel(&id));
        assert!(running.is_empty());
    }
}
