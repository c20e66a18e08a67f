//! Resolution error types.

use crate::concat::ConcatError;
use modproxy_storage::StorageError;
use thiserror::Error;

/// Coarse classification of a [`ResolveError`], used by callers to pick a
/// fallback or a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The module or version does not exist (HTTP 404 at the boundary).
    NotFound,
    /// An exclusive create lost the race. Never escapes the engine.
    PreconditionFailed,
    /// Everything else.
    Internal,
}

/// Errors produced by the resolution engine.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("command {command} failed: {reason}\n{log}")]
    Command {
        command: String,
        reason: String,
        log: String,
    },

    #[error("unexpected output from {command}: {reason}")]
    ToolchainOutput { command: String, reason: String },

    #[error("upstream proxy error: {0}")]
    Upstream(String),

    #[error("invalid concat object: {0}")]
    Concat(#[from] ConcatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object {key} has invalid metadata: {reason}")]
    InvalidMetadata { key: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::NotFound(_) | ResolveError::Storage(StorageError::NotFound(_)) => {
                ErrorKind::NotFound
            }
            ResolveError::Storage(StorageError::PreconditionFailed(_)) => {
                ErrorKind::PreconditionFailed
            }
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        ResolveError::NotFound(message.into())
    }
}

/// Result type for resolution operations.
pub type ResolveResult<T> = std::result::Result<T, ResolveError>;
