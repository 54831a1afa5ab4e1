//! Event Dispatcher
//!
//! Routes daemon push notifications to the owning task. Notifications are
//! handled one at a time, in the order the daemon delivered them.

use crate::coordinator::Coordinator;
use crate::protocol::{Gid, TaskState};
use crate::registry::TrackedTask;
use crate::rpc::{Notification, NotificationKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

impl Coordinator {
    /// Handle one notification
    pub(crate) async fn dispatch(&self, notification: Notification) {
        let Notification { kind, gid } = notification;
        let Some(task) = self.registry().lookup(&gid) else {
            tracing::trace!("Dropping {:?} for untracked gid {}", kind, gid);
            return;
        };

        match kind {
            NotificationKind::DownloadStart => {
                self.refresh_logged(kind, &gid, &task).await;
            }
            NotificationKind::DownloadPause | NotificationKind::DownloadStop => {
                tracing::trace!("Ignoring {} for {} (task {})", kind.method(), gid, task.key());
            }
            NotificationKind::DownloadError => {
                if self.refresh_logged(kind, &gid, &task).await {
                    self.registry().unregister(&gid);
                }
            }
            NotificationKind::BtDownloadComplete => {
                if !self.refresh_logged(kind, &gid, &task).await {
                    return;
                }
                if let Err(e) = self.finalize(&task).await {
                    tracing::warn!(
                        "Collecting files for task {} failed, retrying on next heartbeat: {}",
                        task.key(),
                        e
                    );
                }
                // Keep the gid while finalization is outstanding so the heartbeat retries it
                let awaiting_files = task.state() == TaskState::Complete && !task.is_settled();
                if !awaiting_files {
                    self.registry().unregister(&gid);
                }
            }
            NotificationKind::DownloadComplete => {
                tracing::debug!(
                    "Plain download complete for {} (task {}), left to the heartbeat",
                    gid,
                    task.key()
                );
            }
        }
    }

    /// Refresh and log RPC failures; returns whether reconciliation ran
    async fn refresh_logged(
        &self,
        kind: NotificationKind,
        gid: &Gid,
        task: &Arc<TrackedTask>,
    ) -> bool {
        match self.refresh(gid, task).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Status for {} after {} (task {}) failed: {}",
                    gid,
                    kind.method(),
                    task.key(),
                    e
                );
                false
            }
        }
    }
}

/// Dispatcher loop: runs until the stream ends or `shutdown` fires
pub(crate) async fn run(
    coordinator: Arc<Coordinator>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            notification = notifications.recv() => {
                match notification {
                    Some(notification) => coordinator.dispatch(notification).await,
                    None if coordinator.is_closing() => {
                        tracing::debug!("Daemon notification stream closed on shutdown");
                        break;
                    }
                    None => {
                        tracing::warn!("Daemon notification stream closed; relying on heartbeat");
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
