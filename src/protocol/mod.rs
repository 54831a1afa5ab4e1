//! Protocol types for gosh-aria2
//!
//! This module contains all types that cross the engine boundary:
//! - Identifiers and lifecycle states
//! - Status snapshots reported by the daemon
//! - Events emitted by the engine
//! - Options and listener hooks for submissions
//! - The daemon's failure payload
//!
//! Everything except the listener hooks is serializable so it can be
//! forwarded over IPC or stored by a frontend.

mod error;
mod events;
mod options;
mod status;
mod types;

pub use error::{TransferFailure, CANCELED_CODE};
pub use events::{DownloadEvent, TaskEvent};
pub(crate) use options::notify_listener;
pub use options::{SubmitOptions, TaskListener};
pub use status::{Downloaded, StatusSnapshot, TaskSnapshot, TransferFile};
pub use types::{Gid, GidState, Progress, TaskState, TransferStatus};
