//! RPC channel to the transfer daemon
//!
//! [`TransferRpc`] is the seam between the orchestrator and whatever speaks
//! to aria2. [`WsRpcClient`] implements it over aria2's WebSocket JSON-RPC
//! endpoint; tests substitute scripted implementations.

mod client;
pub(crate) mod message;

pub use client::WsRpcClient;

use crate::error::Result;
use crate::protocol::{Gid, StatusSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Remote procedures the orchestrator needs from the daemon
#[async_trait]
pub trait TransferRpc: Send + Sync {
    /// `aria2.addUri`: start a transfer, returns its gid
    async fn add_uri(&self, uris: &[String], options: &TransferOptions) -> Result<Gid>;

    /// `aria2.tellStatus`: full status of one gid
    async fn tell_status(&self, gid: &Gid) -> Result<StatusSnapshot>;

    /// `aria2.getVersion`
    async fn get_version(&self) -> Result<String>;

    /// `aria2.shutdown`: returns the daemon's answer, `"OK"` on success
    async fn shutdown(&self) -> Result<String>;

    /// `aria2.forceRemove`
    async fn force_remove(&self, gid: &Gid) -> Result<()>;
}

/// Per-transfer options sent with `aria2.addUri`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Save directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Comma-separated tracker announce URLs
    #[serde(rename = "bt-tracker", skip_serializing_if = "Option::is_none")]
    pub bt_tracker: Option<String>,

    /// Proxy for every protocol
    #[serde(rename = "all-proxy", skip_serializing_if = "Option::is_none")]
    pub all_proxy: Option<String>,
}

/// Kinds of push notifications aria2 sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    DownloadStart,
    DownloadPause,
    DownloadStop,
    DownloadComplete,
    DownloadError,
    BtDownloadComplete,
}

impl NotificationKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "aria2.onDownloadStart" => Some(Self::DownloadStart),
            "aria2.onDownloadPause" => Some(Self::DownloadPause),
            "aria2.onDownloadStop" => Some(Self::DownloadStop),
            "aria2.onDownloadComplete" => Some(Self::DownloadComplete),
            "aria2.onDownloadError" => Some(Self::DownloadError),
            "aria2.onBtDownloadComplete" => Some(Self::BtDownloadComplete),
            _ => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::DownloadStart => "aria2.onDownloadStart",
            Self::DownloadPause => "aria2.onDownloadPause",
            Self::DownloadStop => "aria2.onDownloadStop",
            Self::DownloadComplete => "aria2.onDownloadComplete",
            Self::DownloadError => "aria2.onDownloadError",
            Self::BtDownloadComplete => "aria2.onBtDownloadComplete",
        }
    }
}

/// A push notification for one gid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub gid: Gid,
}

impl Notification {
    pub fn new(kind: NotificationKind, gid: impl Into<Gid>) -> Self {
        Self {
            kind,
            gid: gid.into(),
        }
    }
}
