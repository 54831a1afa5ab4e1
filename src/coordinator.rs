//! Coordinator - shared core of the dispatcher and the heartbeat
//!
//! Both update sources end up here: fetch a snapshot, run it through the
//! task's state machine under the task lock, then act on the returned
//! [`Transition`] outside the lock. Settling the task's future happens in
//! exactly two places, [`Coordinator::reject`] and [`Coordinator::finalize`],
//! and the result slot can only be taken once.
//!
//! A state change and the event it produces go out under the task's order
//! lock, and settling takes the same lock. Listeners and subscribers
//! therefore see events in state order and never see an update after the
//! task resolved or failed.

use crate::error::{EngineError, Result};
use crate::protocol::{notify_listener, DownloadEvent, Downloaded, Gid, TaskEvent, TaskState};
use crate::reconciler::{Outcome, Task, Transition};
use crate::registry::{TaskRegistry, TrackedTask};
use crate::rpc::TransferRpc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub(crate) struct Coordinator {
    rpc: Arc<dyn TransferRpc>,
    registry: Arc<TaskRegistry>,
    events: broadcast::Sender<DownloadEvent>,
    /// Set while a shutdown request is in flight
    closing: AtomicBool,
}

impl Coordinator {
    pub(crate) fn new(
        rpc: Arc<dyn TransferRpc>,
        registry: Arc<TaskRegistry>,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Self {
        Self {
            rpc,
            registry,
            events,
            closing: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::Release);
    }

    /// Whether the daemon is being shut down on purpose
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn rpc(&self) -> &Arc<dyn TransferRpc> {
        &self.rpc
    }

    pub(crate) fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Fetch a fresh status for `gid` and reconcile it into `task`
    pub(crate) async fn refresh(&self, gid: &Gid, task: &Arc<TrackedTask>) -> Result<()> {
        let snapshot = self.rpc.tell_status(gid).await?;
        if let Some(transition) = self.transition(task, |t| Some(t.reconcile(&snapshot))) {
            self.apply(task, transition).await;
        }
        Ok(())
    }

    /// Change the task's state and emit the resulting event in one ordered
    /// step. Returns `None` without touching a settled task.
    fn transition(
        &self,
        task: &TrackedTask,
        change: impl FnOnce(&mut Task) -> Option<Transition>,
    ) -> Option<Transition> {
        let _order = task.order();
        if task.is_settled() {
            return None;
        }
        let mut transition = task.with_task(change)?;
        if let Some(event) = transition.event.take() {
            self.emit(task, event);
        }
        Some(transition)
    }

    /// Act on an emitted transition: index new gids, settle
    async fn apply(&self, task: &Arc<TrackedTask>, transition: Transition) {
        for gid in transition.discovered {
            tracing::debug!("Task {} discovered content transfer {}", task.key(), gid);
            self.registry.register(gid, task);
        }

        match transition.outcome {
            Some(Outcome::Failed(failure)) => {
                let err = if failure.is_canceled() {
                    EngineError::Canceled {
                        key: task.key().to_string(),
                    }
                } else {
                    EngineError::Transfer(failure)
                };
                self.reject(task, err);
            }
            Some(Outcome::Completed) => {
                if let Err(e) = self.finalize(task).await {
                    tracing::warn!(
                        "Collecting files for task {} failed, retrying on next heartbeat: {}",
                        task.key(),
                        e
                    );
                }
            }
            None => {}
        }
    }

    fn emit(&self, task: &TrackedTask, event: TaskEvent) {
        if let Some(listener) = task.listener() {
            notify_listener(listener.as_ref(), &event);
        }
        let _ = self.events.send(DownloadEvent::Update {
            key: task.key().to_string(),
            event,
        });
    }

    /// Reject the task's future and drop it from the registry
    pub(crate) fn reject(&self, task: &Arc<TrackedTask>, err: EngineError) {
        let message = err.to_string();
        let _order = task.order();
        if task.settle(Err(err)) {
            tracing::info!("Download task {} failed: {}", task.key(), message);
            let _ = self.events.send(DownloadEvent::Rejected {
                key: task.key().to_string(),
                error: message,
            });
        }
        self.registry.forget(task);
    }

    /// Collect file lists of a completed task and resolve its future.
    ///
    /// No-op unless the task is `complete` and unsettled. On RPC failure the
    /// task stays registered so the next heartbeat tries again.
    pub(crate) async fn finalize(&self, task: &Arc<TrackedTask>) -> Result<()> {
        if task.state() != TaskState::Complete || task.is_settled() {
            return Ok(());
        }
        if !task.begin_finalize() {
            return Ok(());
        }

        let gids = task.with_task(|t| t.content_gids());
        let statuses =
            futures::future::try_join_all(gids.iter().map(|gid| self.rpc.tell_status(gid))).await;
        let statuses = match statuses {
            Ok(statuses) => statuses,
            Err(e) => {
                task.end_finalize();
                return Err(e);
            }
        };

        let files: Vec<PathBuf> = statuses
            .iter()
            .flat_map(|status| status.file_paths().cloned())
            .collect();

        {
            let _order = task.order();
            if task.settle(Ok(Downloaded {
                files: files.clone(),
            })) {
                tracing::info!(
                    "Download task {} finished with {} file(s)",
                    task.key(),
                    files.len()
                );
                let _ = self.events.send(DownloadEvent::Resolved {
                    key: task.key().to_string(),
                    files,
                });
            }
        }
        self.registry.forget(task);
        Ok(())
    }

    /// Cancel a live task; its transfers are removed from the daemon best-effort
    pub(crate) async fn cancel(&self, task: &Arc<TrackedTask>) -> bool {
        let mut gids = Vec::new();
        let Some(transition) = self.transition(task, |t| {
            gids = t.gids();
            t.cancel()
        }) else {
            return false;
        };
        self.apply(task, transition).await;

        for gid in gids {
            if let Err(e) = self.rpc.force_remove(&gid).await {
                tracing::debug!("Removing {} for canceled task {}: {}", gid, task.key(), e);
            }
        }
        true
    }

    /// Reject every live task with `Shutdown` and empty the registry
    pub(crate) fn teardown(&self) {
        for task in self.registry.clear() {
            let message = EngineError::Shutdown.to_string();
            let _order = task.order();
            if task.settle(Err(EngineError::Shutdown)) {
                let _ = self.events.send(DownloadEvent::Rejected {
                    key: task.key().to_string(),
                    error: message,
                });
            }
        }
    }
}
