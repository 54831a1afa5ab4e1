//! Status types
//!
//! Snapshots reported by the daemon and the views the engine hands back.

use super::error::TransferFailure;
use super::types::{Gid, Progress, TaskState, TransferStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One file belonging to a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFile {
    /// 1-based index inside the transfer
    pub index: u32,
    /// Path on disk (empty while metadata is unresolved)
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Completed bytes
    pub completed_length: u64,
    /// Whether the file is selected for download
    pub selected: bool,
}

/// Status of one gid at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub gid: Gid,
    pub status: TransferStatus,
    pub completed_length: u64,
    pub total_length: u64,
    pub connections: u32,
    pub download_speed: u64,
    /// aria2 reports `errorCode`/`errorMessage` for stopped transfers
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub files: Vec<TransferFile>,
    /// Gids spawned once this (metadata) transfer resolved
    pub followed_by: Vec<Gid>,
}

impl StatusSnapshot {
    /// Snapshot with zero counters, handy for building test fixtures
    pub fn new(gid: impl Into<Gid>, status: TransferStatus) -> Self {
        Self {
            gid: gid.into(),
            status,
            completed_length: 0,
            total_length: 0,
            connections: 0,
            download_speed: 0,
            error_code: None,
            error_message: None,
            files: Vec::new(),
            followed_by: Vec::new(),
        }
    }

    pub fn with_lengths(mut self, completed: u64, total: u64) -> Self {
        self.completed_length = completed;
        self.total_length = total;
        self
    }

    pub fn with_activity(mut self, connections: u32, speed: u64) -> Self {
        self.connections = connections;
        self.download_speed = speed;
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_followed_by<I, G>(mut self, gids: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<Gid>,
    {
        self.followed_by = gids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, length: u64) -> Self {
        let index = self.files.len() as u32 + 1;
        self.files.push(TransferFile {
            index,
            path: path.into(),
            length,
            completed_length: length,
            selected: true,
        });
        self
    }

    /// Failure payload derived from the daemon's error fields
    pub fn failure(&self) -> TransferFailure {
        let code = self.error_code.clone().unwrap_or_default();
        let message = match (&self.error_message, self.status) {
            (Some(message), _) if !message.is_empty() => message.clone(),
            (_, TransferStatus::Removed) => "Transfer removed by the daemon".to_string(),
            _ => format!("Transfer {} failed", self.gid),
        };
        TransferFailure { code, message }
    }

    /// Paths of every file with a known location, selected or not
    pub fn file_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files
            .iter()
            .filter(|f| !f.path.as_os_str().is_empty())
            .map(|f| &f.path)
    }
}

/// Result of a finished download
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downloaded {
    /// Every file produced by the task's content transfers
    pub files: Vec<PathBuf>,
}

/// Point-in-time view of a tracked task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub key: String,
    pub magnet: String,
    pub state: TaskState,
    pub metadata_gid: Gid,
    pub file_gids: Vec<Gid>,
    /// Aggregate over known content transfers (metadata transfer while resolving)
    pub progress: Progress,
    pub failure: Option<TransferFailure>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
