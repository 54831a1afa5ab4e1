//! Core protocol types
//!
//! Fundamental types used throughout the protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Daemon-assigned identifier for one tracked transfer.
///
/// aria2 hands out 16-character hex strings; the value is kept opaque here
/// since only the daemon interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gid(String);

impl Gid {
    pub fn new(gid: impl Into<String>) -> Self {
        Self(gid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Gid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Gid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of one submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Submitted, nothing observed yet
    Waiting,
    /// Resolving the magnet into a file list
    Metadata,
    /// Content transfers discovered and running
    Downloading,
    /// Every content transfer finished
    Complete,
    /// Metadata or a content transfer failed, or the task was canceled
    Error,
}

impl TaskState {
    /// `Complete` and `Error` accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Metadata => write!(f, "metadata"),
            Self::Downloading => write!(f, "downloading"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Status of a transfer as reported by aria2's `tellStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "complete" => Ok(Self::Complete),
            "removed" => Ok(Self::Removed),
            _ => Err(format!("Unknown transfer status: {}", s)),
        }
    }
}

/// Per-gid progress sub-state tracked by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GidState {
    Active,
    Error,
    Complete,
}

/// Progress payload handed to listeners
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes transferred so far
    pub completed_bytes: u64,
    /// Total bytes (0 while unknown)
    pub total_bytes: u64,
    /// Peer/server connections of the transfer that triggered this update
    pub connections: u32,
    /// Download speed in bytes/sec of the transfer that triggered this update
    pub speed: u64,
}

impl Progress {
    /// Calculate progress percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.completed_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }
}
