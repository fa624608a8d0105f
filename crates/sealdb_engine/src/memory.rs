//! In-memory engine for testing.

use crate::error::{EngineError, EngineResult};
use crate::{KeyPage, KvEngine, ReadView, ScanPage, WriteBatch};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// An in-memory key/value engine.
///
/// Suitable for unit tests, integration tests and ephemeral databases.
/// Views clone the tree, which gives true snapshot semantics at a cost
/// that is acceptable for test-sized data sets.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    tree: Arc<RwLock<Tree>>,
    closed: AtomicBool,
}

impl MemoryEngine {
    /// Creates a new empty in-memory engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    /// Whether the engine stores no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    fn check_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

impl KvEngine for MemoryEngine {
    fn view(&self) -> EngineResult<Box<dyn ReadView>> {
        self.check_open()?;
        Ok(Box::new(MemoryView {
            snapshot: self.tree.read().clone(),
        }))
    }

    fn apply(&self, batch: WriteBatch) -> EngineResult<()> {
        self.check_open()?;
        let mut tree = self.tree.write();
        for op in batch.into_ops() {
            match op {
                crate::BatchOp::Put { key, value } => {
                    tree.insert(key, value);
                }
                crate::BatchOp::Delete { key } => {
                    tree.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryView {
    snapshot: Tree,
}

impl ReadView for MemoryView {
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key).cloned())
    }

    fn scan(&self, from: &[u8], prefix: &[u8], limit: usize) -> EngineResult<ScanPage> {
        let mut page = ScanPage::default();
        for (key, value) in self.snapshot.range(from.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if page.entries.len() == limit {
                page.more = true;
                break;
            }
            page.entries.push((key.clone(), value.clone()));
        }
        Ok(page)
    }

    fn scan_keys(&self, from: &[u8], prefix: &[u8], limit: usize) -> EngineResult<KeyPage> {
        let mut page = KeyPage::default();
        for (key, _) in self.snapshot.range(from.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if page.keys.len() == limit {
                page.more = true;
                break;
            }
            page.keys.push(key.clone());
        }
        Ok(page)
    }
}
