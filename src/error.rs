//! Typed error hierarchy for gosh-aria2
//!
//! Every error type includes context about what went wrong and whether
//! the operation can be retried.

use crate::protocol::TransferFailure;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Debug, Error)]
pub enum EngineError {
    /// The daemon could not be spawned or never signalled readiness
    #[error("Daemon startup failed: {message}")]
    DaemonStartup { message: String },

    /// An operation did not finish within its configured bound
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Transport or protocol failure on the RPC channel
    #[error("RPC error: {message}")]
    Rpc {
        kind: RpcErrorKind,
        message: String,
        retryable: bool,
    },

    /// The daemon reported an error for the metadata transfer or a file transfer
    #[error("Transfer failed: {0}")]
    Transfer(TransferFailure),

    /// Invalid input from user
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// A task with this key is still in flight
    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    /// Task was canceled by the caller
    #[error("Task canceled: {key}")]
    Canceled { key: String },

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Local filesystem or process I/O error
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// RPC error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Could not open the WebSocket connection
    Connect,
    /// Connection dropped while a call was in flight
    ConnectionClosed,
    /// The daemon answered with a JSON-RPC error object
    Remote(i64),
    /// The daemon answered with something we could not interpret
    InvalidResponse,
    /// Session is not started
    NotConnected,
    /// Other transport error
    Other,
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Create an RPC error
    pub fn rpc(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            RpcErrorKind::Connect | RpcErrorKind::ConnectionClosed | RpcErrorKind::Other
        );
        Self::Rpc {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a daemon startup error
    pub fn startup(message: impl Into<String>) -> Self {
        Self::DaemonStartup {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// The daemon-supplied failure, if this is a transfer error
    pub fn transfer_failure(&self) -> Option<&TransferFailure> {
        match self {
            Self::Transfer(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::rpc(
            RpcErrorKind::InvalidResponse,
            format!("JSON error: {}", err),
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        let kind = match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => RpcErrorKind::ConnectionClosed,
            WsError::Io(_) => RpcErrorKind::Connect,
            _ => RpcErrorKind::Other,
        };
        Self::rpc(kind, err.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::invalid_input("url", err.to_string())
    }
}
