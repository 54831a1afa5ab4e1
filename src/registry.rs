//! Task Registry
//!
//! Indexes live tasks by gid (many gids to one task) and by caller key. The
//! task owns its gids; the registry only points back at it. A registry lives
//! as long as one running engine and is cleared when the daemon shuts down.

use crate::error::{EngineError, Result};
use crate::protocol::{Downloaded, Gid, TaskListener, TaskSnapshot, TaskState};
use crate::reconciler::Task;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Sender half of a task's single-resolution result slot
pub type ResultSender = oneshot::Sender<Result<Downloaded>>;

/// A task plus everything the engine needs around it
pub struct TrackedTask {
    key: String,
    task: Mutex<Task>,
    listener: Option<Arc<dyn TaskListener>>,
    result: Mutex<Option<ResultSender>>,
    finalizing: AtomicBool,
    /// Held from a state change until its event is out, and while settling
    order: Mutex<()>,
}

impl TrackedTask {
    pub fn new(
        task: Task,
        listener: Option<Arc<dyn TaskListener>>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Downloaded>>) {
        let (tx, rx) = oneshot::channel();
        let tracked = Arc::new(Self {
            key: task.key().to_string(),
            task: Mutex::new(task),
            listener,
            result: Mutex::new(Some(tx)),
            finalizing: AtomicBool::new(false),
            order: Mutex::new(()),
        });
        (tracked, rx)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> TaskState {
        self.task.lock().state()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.task.lock().snapshot()
    }

    /// Run `f` with the task locked. Keep `f` free of I/O.
    pub fn with_task<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut task = self.task.lock();
        f(&mut *task)
    }

    pub fn listener(&self) -> Option<&Arc<dyn TaskListener>> {
        self.listener.as_ref()
    }

    /// Whether the result slot has been consumed
    pub fn is_settled(&self) -> bool {
        self.result.lock().is_none()
    }

    /// Complete the task's future. Only the first call has any effect.
    pub fn settle(&self, result: Result<Downloaded>) -> bool {
        let Some(tx) = self.result.lock().take() else {
            return false;
        };
        // Caller may have dropped the future; the task still ends here
        let _ = tx.send(result);
        true
    }

    /// Claim the right to collect file lists; false if another path holds it
    pub(crate) fn begin_finalize(&self) -> bool {
        !self.finalizing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_finalize(&self) {
        self.finalizing.store(false, Ordering::Release);
    }

    /// Serializes event delivery with settlement. Never hold across an await.
    pub(crate) fn order(&self) -> MutexGuard<'_, ()> {
        self.order.lock()
    }
}

impl std::fmt::Debug for TrackedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedTask")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// gid → task index
#[derive(Default)]
pub struct TaskRegistry {
    by_gid: RwLock<HashMap<Gid, Arc<TrackedTask>>>,
    by_key: RwLock<HashMap<String, Arc<TrackedTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new task under its key
    pub fn track(&self, task: &Arc<TrackedTask>) -> Result<()> {
        let mut by_key = self.by_key.write();
        if by_key.contains_key(task.key()) {
            return Err(EngineError::AlreadyExists(task.key().to_string()));
        }
        by_key.insert(task.key().to_string(), Arc::clone(task));
        Ok(())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.read().contains_key(key)
    }

    pub fn find(&self, key: &str) -> Option<Arc<TrackedTask>> {
        self.by_key.read().get(key).cloned()
    }

    /// Point `gid` at `task`. A gid already owned by another task keeps its owner.
    pub fn register(&self, gid: Gid, task: &Arc<TrackedTask>) -> bool {
        let mut by_gid = self.by_gid.write();
        match by_gid.get(&gid) {
            Some(owner) if !Arc::ptr_eq(owner, task) => {
                tracing::warn!(
                    "gid {} already belongs to task {}, not reassigning to {}",
                    gid,
                    owner.key(),
                    task.key()
                );
                false
            }
            _ => {
                by_gid.insert(gid, Arc::clone(task));
                true
            }
        }
    }

    pub fn lookup(&self, gid: &Gid) -> Option<Arc<TrackedTask>> {
        self.by_gid.read().get(gid).cloned()
    }

    pub fn unregister(&self, gid: &Gid) -> Option<Arc<TrackedTask>> {
        self.by_gid.write().remove(gid)
    }

    /// Drop every index entry that points at `task`
    pub fn forget(&self, task: &Arc<TrackedTask>) {
        let gids = task.with_task(|t| t.gids());
        {
            let mut by_gid = self.by_gid.write();
            for gid in gids {
                if by_gid.get(&gid).is_some_and(|owner| Arc::ptr_eq(owner, task)) {
                    by_gid.remove(&gid);
                }
            }
        }
        let mut by_key = self.by_key.write();
        if by_key
            .get(task.key())
            .is_some_and(|owner| Arc::ptr_eq(owner, task))
        {
            by_key.remove(task.key());
        }
    }

    /// Copy of the gid index, for polling without holding the lock
    pub fn tracked(&self) -> Vec<(Gid, Arc<TrackedTask>)> {
        self.by_gid
            .read()
            .iter()
            .map(|(gid, task)| (gid.clone(), Arc::clone(task)))
            .collect()
    }

    pub fn tasks(&self) -> Vec<Arc<TrackedTask>> {
        self.by_key.read().values().cloned().collect()
    }

    /// Number of tracked gids
    pub fn len(&self) -> usize {
        self.by_gid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gid.read().is_empty()
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.by_key.read().len()
    }

    /// Empty both indexes, returning the tasks that were live
    pub fn clear(&self) -> Vec<Arc<TrackedTask>> {
        self.by_gid.write().clear();
        self.by_key.write().drain().map(|(_, task)| task).collect()
    }
}
