//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid module path: {0}")]
    InvalidModulePath(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid escaped string {input:?}: {reason}")]
    InvalidEscape { input: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
