//! Units of work with compensation on failure.
//!
//! Composite storage operations register an inverse for every step that
//! mutates shared state. If the operation fails or is aborted, the
//! recoveries run in reverse order; when it reaches its commit point it
//! calls [`Task::clear_recoveries`] so later unrelated failures cannot
//! undo committed work. Recoveries must be idempotent: a crash may replay
//! them against partially cleaned state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// A named compensation closure.
pub struct Recovery {
    name: String,
    run: Box<dyn FnOnce() + Send>,
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recovery").field("name", &self.name).finish()
    }
}

/// One unit of engine work.
pub struct Task {
    id: Uuid,
    aborted: Arc<AtomicBool>,
    recoveries: Mutex<Vec<Recovery>>,
    abort_callbacks: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_callback: AtomicU64,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("aborted", &self.aborted())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for TaskAbortGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskAbortGuard").field("id", &self.id).finish()
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Task {
    /// Creates a fresh task with a random id.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            aborted: Arc::new(AtomicBool::new(false)),
            recoveries: Mutex::new(Vec::new()),
            abort_callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(0),
        }
    }

    /// The task id, for log correlation.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Whether [`Task::abort`] was called.
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Fails the task cooperatively: sets the flag and fires the topmost
    /// abort callback so the current suspension point returns early.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let callback = self.abort_callbacks.lock().last().map(|(_, cb)| Arc::clone(cb));
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Returns [`Error::ActionStopped`] if the task was aborted.
    pub fn check_abort(&self) -> Result<()> {
        if self.aborted() {
            return Err(Error::ActionStopped);
        }
        Ok(())
    }

    /// Registers an abort callback for the duration of the returned guard.
    ///
    /// Long-running child processes register their kill handle here so
    /// [`Task::abort`] can interrupt the current suspension point.
    pub fn abort_callback(&self, callback: impl Fn() + Send + Sync + 'static) -> TaskAbortGuard<'_> {
        let id = self.next_callback.fetch_add(1, Ordering::SeqCst);
        self.abort_callbacks.lock().push((id, Arc::new(callback)));
        TaskAbortGuard { task: self, id }
    }

    /// Pushes a compensation to run if the task fails before its commit
    /// point.
    pub fn push_recovery(&self, name: impl Into<String>, run: impl FnOnce() + Send + 'static) {
        let name = name.into();
        self.recoveries.lock().push(Recovery {
            name,
            run: Box::new(run),
        });
    }

    /// Commit point: discards pending recoveries so committed work cannot
    /// be undone by a later unrelated failure.
    pub fn clear_recoveries(&self) {
        let dropped = std::mem::take(&mut *self.recoveries.lock());
        if !dropped.is_empty() {
            info!(task = %self.id, count = dropped.len(), "commit point, recoveries cleared");
        }
    }

    /// Number of pending recoveries.
    pub fn pending_recoveries(&self) -> usize {
        self.recoveries.lock().len()
    }

    /// Runs `f`, compensating on failure or abort.
    ///
    /// On error (or when the abort flag is set when `f` returns) the
    /// recovery stack unwinds in LIFO order; recovery failures are logged
    /// and skipped so cleanup is maximised. The original error is returned.
    pub fn run<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        match f(self) {
            Ok(value) => {
                if self.aborted() {
                    self.unwind();
                    return Err(Error::ActionStopped);
                }
                Ok(value)
            }
            Err(err) => {
                warn!(task = %self.id, error = %err, "task failed, running recoveries");
                self.unwind();
                Err(err)
            }
        }
    }

    fn unwind(&self) {
        loop {
            let Some(recovery) = self.recoveries.lock().pop() else {
                return;
            };
            info!(task = %self.id, name = %recovery.name, "running recovery");
            (recovery.run)();
        }
    }
}

/// Deregisters an abort callback when dropped.
pub struct TaskAbortGuard<'a> {
    task: &'a Task,
    id: u64,
}

impl Drop for TaskAbortGuard<'_> {
    fn drop(&mut self) {
        self.task
            .abort_callbacks
            .lock()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn recoveries_run_in_reverse_on_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let task = Task::new();
        for step in 1..=3 {
            let order = Arc::clone(&order);
            task.push_recovery(format!("undo step {step}"), move || {
                order.lock().push(step);
            });
        }

        let result: Result<()> = task.run(|_| Err(Error::ActionStopped));
        assert!(result.is_err());
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert_eq!(task.pending_recoveries(), 0);
    }

    #[test]
    fn success_keeps_recoveries_for_caller_to_clear() {
        let fired = Arc::new(AtomicBool::new(false));
        let task = Task::new();
        let fired_clone = Arc::clone(&fired);
        task.push_recovery("undo", move || fired_clone.store(true, Ordering::SeqCst));

        task.run(|_| Ok(())).unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(task.pending_recoveries(), 1);

        task.clear_recoveries();
        assert_eq!(task.pending_recoveries(), 0);
    }

    #[test]
    fn commit_point_prevents_unwinding() {
        let fired = Arc::new(AtomicUsize::new(0));
        let task = Task::new();
        let fired_clone = Arc::clone(&fired);
        task.push_recovery("undo committed", move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let result: Result<()> = task.run(|task| {
            task.clear_recoveries();
            Err(Error::ActionStopped)
        });
        assert!(result.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_fires_topmost_callback_only() {
        let task = Task::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_clone = Arc::clone(&first);
        let _g1 = task.abort_callback(move || {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        let second_clone = Arc::clone(&second);
        let _g2 = task.abort_callback(move || {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        task.abort();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(task.aborted());
    }

    #[test]
    fn abort_guard_deregisters() {
        let task = Task::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired_clone = Arc::clone(&fired);
            let _guard = task.abort_callback(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            });
        }
        task.abort();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_after_success_still_fails_the_run() {
        let task = Task::new();
        let result = task.run(|task| {
            task.abort();
            Ok(())
        });
        assert!(matches!(result, Err(Error::ActionStopped)));
    }
}
