//! Mock Daemon
//!
//! An in-memory `TransferRpc` whose transfer statuses are scripted by the
//! test, plus a listener that records every callback.

#![allow(dead_code)]

use async_trait::async_trait;
use gosh_aria2::{
    EngineError, Gid, Progress, Result, RpcErrorKind, StatusSnapshot, TaskEvent, TaskListener,
    TransferFailure, TransferOptions, TransferRpc, TransferStatus,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted aria2 stand-in.
///
/// `add_uri` hands out gids `meta-1`, `meta-2`, ... and leaves each new
/// transfer `waiting` unless the test already scripted a status for it.
pub struct ScriptedRpc {
    statuses: Mutex<HashMap<Gid, StatusSnapshot>>,
    failing: Mutex<HashSet<Gid>>,
    added: Mutex<Vec<(Vec<String>, TransferOptions)>>,
    removed: Mutex<Vec<Gid>>,
    shutdown_answer: Mutex<String>,
    next_gid: AtomicUsize,
    status_calls: AtomicUsize,
}

impl ScriptedRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            shutdown_answer: Mutex::new("OK".to_string()),
            next_gid: AtomicUsize::new(1),
            status_calls: AtomicUsize::new(0),
        })
    }

    /// Replace the status `tell_status` reports for the snapshot's gid
    pub fn set_status(&self, snapshot: StatusSnapshot) {
        self.statuses.lock().insert(snapshot.gid.clone(), snapshot);
    }

    /// Make `tell_status` for `gid` fail with a transport error
    pub fn fail_status(&self, gid: &str, failing: bool) {
        let gid = Gid::new(gid);
        if failing {
            self.failing.lock().insert(gid);
        } else {
            self.failing.lock().remove(&gid);
        }
    }

    pub fn set_shutdown_answer(&self, answer: &str) {
        *self.shutdown_answer.lock() = answer.to_string();
    }

    pub fn added(&self) -> Vec<(Vec<String>, TransferOptions)> {
        self.added.lock().clone()
    }

    pub fn removed(&self) -> Vec<Gid> {
        self.removed.lock().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferRpc for ScriptedRpc {
    async fn add_uri(&self, uris: &[String], options: &TransferOptions) -> Result<Gid> {
        let gid = Gid::new(format!(
            "meta-{}",
            self.next_gid.fetch_add(1, Ordering::SeqCst)
        ));
        self.added.lock().push((uris.to_vec(), options.clone()));
        self.statuses
            .lock()
            .entry(gid.clone())
            .or_insert_with(|| StatusSnapshot::new(gid.clone(), TransferStatus::Waiting));
        Ok(gid)
    }

    async fn tell_status(&self, gid: &Gid) -> Result<StatusSnapshot> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(gid) {
            return Err(EngineError::rpc(
                RpcErrorKind::ConnectionClosed,
                "scripted transport failure",
            ));
        }
        self.statuses.lock().get(gid).cloned().ok_or_else(|| {
            EngineError::rpc(RpcErrorKind::Remote(1), format!("GID {} is not found", gid))
        })
    }

    async fn get_version(&self) -> Result<String> {
        Ok("1.37.0".to_string())
    }

    async fn shutdown(&self) -> Result<String> {
        Ok(self.shutdown_answer.lock().clone())
    }

    async fn force_remove(&self, gid: &Gid) -> Result<()> {
        self.removed.lock().push(gid.clone());
        Ok(())
    }
}

/// Listener that keeps every callback in order
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&TaskEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl TaskListener for RecordingListener {
    fn on_metadata_progress(&self, progress: Progress) {
        self.events.lock().push(TaskEvent::MetadataProgress(progress));
    }

    fn on_metadata_complete(&self, progress: Progress) {
        self.events.lock().push(TaskEvent::MetadataComplete(progress));
    }

    fn on_progress(&self, progress: Progress) {
        self.events.lock().push(TaskEvent::Progress(progress));
    }

    fn on_complete(&self, progress: Progress) {
        self.events.lock().push(TaskEvent::Complete(progress));
    }

    fn on_error(&self, failure: &TransferFailure) {
        self.events.lock().push(TaskEvent::Error(failure.clone()));
    }
}

/// Poll `condition` until it holds or `limit` passes
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
