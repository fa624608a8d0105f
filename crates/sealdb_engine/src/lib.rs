//! # SealDB Engine
//!
//! Ordered key/value engine seam for SealDB.
//!
//! Engines are **opaque byte stores** - they never interpret keys or
//! values. SealDB owns the key layout and the encryption of values; the
//! engine only has to provide:
//!
//! - snapshot read views (a view never observes writes committed after it
//!   was opened)
//! - atomic application of multi-key write batches
//! - ascending byte-order scans, resumable in bounded pages
//!
//! ## Available engines
//!
//! - [`MemoryEngine`] - for tests and ephemeral stores
//! - [`RedbEngine`] - persistent storage backed by `redb`
//!
//! ## Example
//!
//! ```rust
//! use sealdb_engine::{KvEngine, MemoryEngine, ReadView, WriteBatch};
//!
//! let engine = MemoryEngine::new();
//! let mut batch = WriteBatch::new();
//! batch.put(b"a".to_vec(), b"1".to_vec());
//! engine.apply(batch).unwrap();
//!
//! let view = engine.view().unwrap();
//! assert_eq!(view.get(b"a").unwrap(), Some(b"1".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod redb;

pub use error::{EngineError, EngineResult};
pub use memory::MemoryEngine;
pub use crate::redb::RedbEngine;

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key` with `value`.
    Put {
        /// The engine key.
        key: Vec<u8>,
        /// The stored value.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// The engine key.
        key: Vec<u8>,
    },
}

impl BatchOp {
    /// Returns the key this operation touches.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// An ordered set of mutations applied atomically.
///
/// Either every operation of a batch becomes visible or none does.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty batch with room for `capacity` operations.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    /// Appends a put operation.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    /// Appends a delete operation.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    /// Number of operations in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch contains no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch and returns its operations in order.
    #[must_use]
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// The operations in order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// One page of an ascending scan.
#[derive(Debug, Default)]
pub struct ScanPage {
    /// Key/value pairs in ascending byte order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// True when further keys under the requested prefix may exist.
    ///
    /// Resume by scanning again from the successor of the last returned
    /// key.
    pub more: bool,
}

/// One page of a keys-only ascending scan.
#[derive(Debug, Default)]
pub struct KeyPage {
    /// Keys in ascending byte order.
    pub keys: Vec<Vec<u8>>,
    /// True when further keys under the requested prefix may exist.
    pub more: bool,
}

/// A snapshot view of the engine.
///
/// A view observes exactly the state committed before it was opened.
/// Later batch applications are invisible to it.
pub trait ReadView: Send {
    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying engine fails.
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>>;

    /// Scans keys `>= from` that start with `prefix`, ascending, up to
    /// `limit` entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying engine fails.
    fn scan(&self, from: &[u8], prefix: &[u8], limit: usize) -> EngineResult<ScanPage>;

    /// Like [`ReadView::scan`] but returns keys only.
    ///
    /// Lets callers enumerate large values (file chunks) without pulling
    /// their payloads into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying engine fails.
    fn scan_keys(&self, from: &[u8], prefix: &[u8], limit: usize) -> EngineResult<KeyPage>;
}

/// An ordered, transactional byte key/value engine.
///
/// # Invariants
///
/// - `apply` is atomic: partial batches are never observable
/// - views are stable snapshots
/// - scans return keys in ascending byte order
pub trait KvEngine: Send + Sync {
    /// Opens a snapshot read view.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying engine fails.
    fn view(&self) -> EngineResult<Box<dyn ReadView>>;

    /// Atomically applies a batch of mutations.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; in that case none of the
    /// batch's operations took effect.
    fn apply(&self, batch: WriteBatch) -> EngineResult<()>;

    /// Flushes and releases engine resources.
    ///
    /// The engine must not be used afterwards; implementations may make
    /// later calls fail with [`EngineError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    fn close(&self) -> EngineResult<()>;
}

/// Returns the immediate byte-lexicographic successor of `key`
/// (`key` followed by a zero byte).
///
/// Used by scan resumption: pass `next_key(last_returned)` as the new
/// `from`.
#[must_use]
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}
