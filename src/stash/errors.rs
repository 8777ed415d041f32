//! Stash errors
//!
//! Stash failures never fail a request. Callers log them and fall back to
//! slower, stronger behavior.

use thiserror::Error;

/// Shared stash errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StashError {
    /// The backing store could not be reached or written
    #[error("stash unavailable: {0}")]
    Unavailable(String),

    /// An I/O operation on the backing store failed
    #[error("stash I/O error on '{key}': {message}")]
    Io { key: String, message: String },

    /// A stored entry could not be decoded
    #[error("stash entry '{key}' is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

impl StashError {
    pub fn io(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    pub fn corrupt(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for stash operations
pub type StashResult<T> = Result<T, StashError>;
