//! Error types for engine operations.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside a key/value engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing store reported a failure.
    #[error("storage backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// The stored data is corrupted.
    #[error("storage corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    /// Wraps a backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }

    /// Wraps a corruption report.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}
