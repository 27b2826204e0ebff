//! Pool and slot errors.
//!
//! Every operation on a [`MetadataPool`](crate::pool::MetadataPool) or one of
//! its slots reports failure through [`PoolError`]. Bad client input is
//! logged and returned; pool state is left unchanged.

use thiserror::Error;

/// Errors that can occur while creating, configuring or using a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Bad tag, bad count, empty payload or otherwise malformed input.
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// The operation is not legal for this pool type.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The slot is not valid, the pool is not ready, or the slot's storage
    /// mode does not support the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An allocation limit or the bounded subscriber table was exhausted.
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// Nothing to act on: unresolvable tag, no buffer attached.
    #[error("No such entry: {0}")]
    NoSuch(String),

    /// Waiting for deferred pool creation exceeded its bound.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration file I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Short, stable name of the error class, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArg(_) => "InvalidArg",
            Self::Unsupported(_) => "Unsupported",
            Self::InvalidState(_) => "InvalidState",
            Self::NoMemory(_) => "NoMemory",
            Self::NoSuch(_) => "NoSuch",
            Self::Timeout(_) => "Timeout",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
        }
    }
}
