//! Serializable failure payload
//!
//! [`TransferFailure`] is what listeners receive in `on_error` and what a
//! rejected download carries inside [`crate::EngineError::Transfer`]. It
//! holds the daemon's own error code and message untouched.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Code used when the caller cancels a task
pub const CANCELED_CODE: &str = "canceled";

/// Daemon-reported failure of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    /// aria2 error code (decimal string, e.g. `"1"`), or `canceled`
    pub code: String,
    /// Human-readable message from the daemon
    pub message: String,
}

impl TransferFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(CANCELED_CODE, "Task canceled")
    }

    pub fn is_canceled(&self) -> bool {
        self.code == CANCELED_CODE
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}
