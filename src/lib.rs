//! # gosh-aria2
//!
//! Magnet download orchestration on top of an aria2 daemon.
//!
//! ## Features
//!
//! - **Daemon lifecycle**: spawn `aria2c` with a JSON-RPC listener, or attach to a running one
//! - **Task tracking**: one task per magnet, following the metadata transfer into its file transfers
//! - **Push + poll**: WebSocket notifications for latency, a heartbeat poller for correctness
//! - **Exactly-once results**: every submission resolves or rejects once
//! - **Async**: Built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gosh_aria2::{DownloadEngine, EngineConfig, SubmitOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DownloadEngine::new(EngineConfig::default())?;
//!
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let downloaded = engine
//!         .download(
//!             "episode-01",
//!             "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
//!             SubmitOptions::default(),
//!         )
//!         .await?;
//!     println!("Files: {:?}", downloaded.files);
//!
//!     engine.close().await;
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod rpc;

mod coordinator;
mod dispatcher;
mod heartbeat;

// Re-exports for convenience
pub use config::{DaemonConfig, DebugConfig, EngineConfig, ProxySetting};
pub use daemon::DaemonSession;
pub use engine::{DownloadEngine, PendingDownload};
pub use error::{EngineError, Result, RpcErrorKind};
pub use protocol::{
    DownloadEvent, Downloaded, Gid, GidState, Progress, StatusSnapshot, SubmitOptions,
    TaskEvent, TaskListener, TaskSnapshot, TaskState, TransferFailure, TransferFile,
    TransferStatus,
};
pub use rpc::{Notification, NotificationKind, TransferOptions, TransferRpc, WsRpcClient};
