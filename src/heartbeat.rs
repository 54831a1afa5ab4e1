//! Heartbeat Poller
//!
//! Polls every tracked gid on a fixed period and feeds the result through
//! the same path as push notifications. This is what completes a task when
//! a notification was missed, arrived before the gid was registered, or its
//! status call failed.

use crate::coordinator::Coordinator;
use crate::error::EngineError;
use crate::protocol::{Gid, TaskState};
use crate::registry::TrackedTask;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

impl Coordinator {
    /// One heartbeat: poll every tracked gid concurrently
    pub(crate) async fn heartbeat(&self) {
        let tracked = self.registry().tracked();
        if tracked.is_empty() {
            return;
        }
        tracing::trace!("Heartbeat polling {} gid(s)", tracked.len());
        futures::future::join_all(tracked.iter().map(|(gid, task)| self.poll(gid, task))).await;
    }

    async fn poll(&self, gid: &Gid, task: &Arc<TrackedTask>) {
        if !task.state().is_terminal() {
            if let Err(e) = self.refresh(gid, task).await {
                tracing::warn!("Heartbeat status for {} (task {}) failed: {}", gid, task.key(), e);
                return;
            }
        }

        match task.state() {
            TaskState::Complete => {
                if let Err(e) = self.finalize(task).await {
                    tracing::warn!("Collecting files for task {} failed: {}", task.key(), e);
                }
            }
            TaskState::Error => {
                // Normally settled by the transition already; this only mops up
                let failure = task.with_task(|t| t.failure().cloned());
                let err = match failure {
                    Some(failure) if failure.is_canceled() => EngineError::Canceled {
                        key: task.key().to_string(),
                    },
                    Some(failure) => EngineError::Transfer(failure),
                    None => EngineError::Internal("task failed without a cause".into()),
                };
                self.reject(task, err);
            }
            _ => {}
        }
    }
}

/// Heartbeat loop: ticks every `period` until `shutdown` fires
pub(crate) async fn run(coordinator: Arc<Coordinator>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => coordinator.heartbeat().await,
            _ = shutdown.cancelled() => break,
        }
    }
}
