//! Error types for SealDB.

use std::io;
use thiserror::Error;

/// Result type for SealDB operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by SealDB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested key, document, file or index does not exist.
    #[error("not found")]
    NotFound,

    /// A new collection or index name hashes onto an existing one.
    ///
    /// Fatal for the creation attempt: pick a different name.
    #[error("name collision: {name:?} hashes onto an existing element")]
    HashCollision {
        /// The colliding name.
        name: String,
    },

    /// The caller passed a zero-length id.
    #[error("ID must be provided")]
    EmptyId,

    /// The named index does not exist on this collection.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Name of the index.
        name: String,
    },

    /// An index with the same name is already registered.
    #[error("index {name:?} already exists")]
    IndexAlreadyExists {
        /// Name of the index.
        name: String,
    },

    /// An index with the same name but a different mapping already
    /// exists.
    #[error("index {name:?} already exists with a different mapping")]
    IndexMappingMismatch {
        /// Name of the index.
        name: String,
    },

    /// A writer handle already owns the file.
    #[error("file is already in write mode")]
    FileInWrite,

    /// The iterator moved past the last valid entry.
    #[error("iterator is not valid")]
    IteratorInvalid,

    /// Normal terminator: no more query results.
    #[error("no more values to retrieve from the query")]
    EndOfQuery,

    /// Normal terminator: read position is at or past the end of the
    /// file.
    #[error("end of file")]
    EndOfFile,

    /// The requested position does not fall inside the file.
    #[error("position {position} is out of the file (size {size})")]
    OutOfFile {
        /// The requested absolute position.
        position: i64,
        /// The file size.
        size: i64,
    },

    /// Decryption failed: the ciphertext does not authenticate under the
    /// expected key. Never retried.
    #[error("authentication failure: value cannot be decrypted")]
    AuthFailure,

    /// The request was cancelled before its commit started.
    #[error("request cancelled")]
    Cancelled,

    /// The request's deadline expired while waiting.
    #[error("request timed out")]
    Timeout,

    /// The underlying engine failed to commit. Never retried.
    #[error("engine failure: {message}")]
    EngineFailure {
        /// Description of the engine failure.
        message: String,
    },

    /// Engine error on a direct (non-coordinated) path.
    #[error("engine error: {0}")]
    Engine(#[from] sealdb_engine::EngineError),

    /// The database or handle has been closed.
    #[error("closed")]
    Closed,

    /// A key has the wrong length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// A stored record failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred while streaming.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backup stream is malformed.
    #[error("invalid backup stream: {message}")]
    InvalidBackup {
        /// Description of the problem.
        message: String,
    },
}

impl Error {
    /// Wraps a coordinator commit failure so it can be fanned out to
    /// every caller of the failed batch.
    pub(crate) fn engine_failure(err: impl std::fmt::Display) -> Self {
        Self::EngineFailure {
            message: err.to_string(),
        }
    }

    /// True for the two normal terminators.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::EndOfQuery | Self::EndOfFile)
    }
}
