//! Tracking of in-flight request tasks.
//!
//! Every per-message task holds a [`TaskGuard`] for its whole life; the guard
//! removes the entry on drop, including when the task is aborted or panics.
//! Shutdown uses the registry to drain (and optionally abort) what is left.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// Identifier of a tracked task.
pub type TaskId = u64;

#[derive(Debug, Default)]
struct Inner {
    next_id: AtomicU64,
    /// `None` until the spawner attaches the task's abort handle.
    tasks: Mutex<HashMap<TaskId, Option<AbortHandle>>>,
}

impl Inner {
    fn remove(&self, id: TaskId) -> bool {
        self.tasks.lock().remove(&id).is_some()
    }
}

/// Set of in-flight tasks. Cloning shares the same set.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new entry and returns the guard that removes it.
    #[must_use]
    pub fn register(&self) -> TaskGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.tasks.lock().insert(id, None);
        TaskGuard {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Records the abort handle of a registered task.
    ///
    /// No-op if the task already finished and removed itself.
    pub fn attach(&self, id: TaskId, handle: AbortHandle) {
        if let Some(slot) = self.inner.tasks.lock().get_mut(&id) {
            *slot = Some(handle);
        }
    }

    /// Registers `future` and spawns it on the current runtime.
    ///
    /// The entry exists before the task is first polled and is removed when
    /// the future completes or is dropped.
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.register();
        let id = guard.id();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await;
        });
        self.attach(id, handle.abort_handle());
        id
    }

    /// Removes an entry. Returns `false` if it was not present.
    pub fn remove(&self, id: TaskId) -> bool {
        self.inner.remove(id)
    }

    /// Ids of the currently registered tasks, ascending.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.inner.tasks.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until no tasks are registered, up to `timeout`.
    ///
    /// Returns `true` if the registry drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Aborts every task that has an attached handle. Returns how many were
    /// signalled. Aborted tasks remove themselves once their future drops.
    pub fn abort_all(&self) -> usize {
        let tasks = self.inner.tasks.lock();
        let mut aborted = 0;
        for handle in tasks.values().flatten() {
            handle.abort();
            aborted += 1;
        }
        aborted
    }
}

/// Removes its registry entry on drop.
#[derive(Debug)]
pub struct TaskGuard {
    id: TaskId,
    inner: Arc<Inner>,
}

impl TaskGuard {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn guard_drop_unregisters() {
        let registry = TaskRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_eq!(registry.snapshot(), vec![a.id(), b.id()]);

        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_absent_is_noop() {
        let registry = TaskRegistry::new();
        assert!(!registry.remove(42));

        let guard = registry.register();
        assert!(registry.remove(guard.id()));
        // Guard drop after explicit removal is also fine.
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn spawned_task_is_tracked_until_done() {
        let registry = TaskRegistry::new();
        let (tx, rx) = oneshot::channel::<()>();

        registry.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(registry.len(), 1);

        tx.send(()).unwrap();
        assert!(registry.wait_for_drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn attach_after_finish_is_noop() {
        let registry = TaskRegistry::new();
        let guard = registry.register();
        let id = guard.id();
        drop(guard);

        let handle = tokio::spawn(async {});
        registry.attach(id, handle.abort_handle());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_stuck_task() {
        let registry = TaskRegistry::new();
        registry.spawn(std::future::pending());

        assert!(!registry.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn abort_all_cancels_and_unregisters() {
        let registry = TaskRegistry::new();
        registry.spawn(std::future::pending());
        registry.spawn(std::future::pending());

        assert_eq!(registry.abort_all(), 2);
        assert!(registry.wait_for_drain(Duration::from_secs(1)).await);
    }
}
