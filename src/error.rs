//! Typed error hierarchy for gosh-swarm
//!
//! Every error carries enough context to decide whether the failure is
//! recovered locally (requeue the block and try again), surfaced as a
//! session health signal, or fatal for the owning session.

use thiserror::Error;

/// Main error type for the transfer engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage backend errors
    #[error("Storage error ({kind:?}): {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },

    /// Protocol-level errors (hash verification, unexpected messages)
    #[error("Protocol error ({kind:?}): {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Invalid input from the embedder
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// File or session not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// File or session already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Session or registry is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Block or hash not present
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// I/O error, may succeed on retry
    Io,
    /// Block number outside the file
    OutOfRange,
    /// Underlying medium is gone; retrying will not help
    Unavailable,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Block data does not match its hash
    HashMismatch,
    /// Block arrived before its hash was known
    MissingHash,
    /// Response for a request id that is not pending
    UnknownRequest,
    /// Peer protocol violation
    PeerProtocol,
}

impl EngineError {
    /// Failures recovered locally by requeuing the block or hash.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            Self::Protocol { kind, .. } => matches!(
                kind,
                ProtocolErrorKind::HashMismatch | ProtocolErrorKind::MissingHash
            ),
            _ => false,
        }
    }

    /// Failures that tear down the owning store and session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                kind: StorageErrorKind::Unavailable,
                ..
            } | Self::Internal(_)
        )
    }

    /// Create a storage error
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self::Storage {
            kind,
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
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

    /// Create an invalid state error
    pub fn invalid_state(action: &'static str, current_state: impl ToString) -> Self {
        Self::InvalidState {
            action,
            current_state: current_state.to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            ErrorKind::UnexpectedEof => StorageErrorKind::OutOfRange,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input("config", format!("JSON error: {}", err))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EngineError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Shutdown
    }
}
