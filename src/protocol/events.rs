//! Task events
//!
//! Emissions decided by the reconciler and broadcast by the engine.

use super::error::TransferFailure;
use super::types::{Gid, Progress};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One listener-visible change of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    /// Metadata transfer moved
    MetadataProgress(Progress),
    /// Metadata resolved; content transfers are known
    MetadataComplete(Progress),
    /// Aggregate content progress
    Progress(Progress),
    /// Every content transfer finished
    Complete(Progress),
    /// Metadata or a content transfer failed
    Error(TransferFailure),
}

/// Events emitted by the download engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownloadEvent {
    /// Task was submitted and its metadata transfer added
    Added { key: String, gid: Gid },
    /// Reconciler emitted a change
    Update { key: String, event: TaskEvent },
    /// Task's future resolved
    Resolved { key: String, files: Vec<PathBuf> },
    /// Task's future rejected
    Rejected { key: String, error: String },
}
