//! Persistent engine backed by `redb`.

use crate::error::{EngineError, EngineResult};
use crate::{BatchOp, KeyPage, KvEngine, ReadView, ScanPage, WriteBatch};
use redb::{Database, ReadOnlyTable, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// The single table holding the whole key space.
///
/// SealDB multiplexes collections, files, related lists and TTL records
/// into one ordered key space via prefix tags, so one table is enough.
const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sealdb");

/// A persistent key/value engine backed by a single `redb` table.
///
/// `redb` provides exactly the contract the seam asks for: ACID write
/// transactions, MVCC read transactions (stable snapshots) and ascending
/// range scans over byte keys. The database file is locked against other
/// processes by `redb` itself.
pub struct RedbEngine {
    db: Database,
    closed: AtomicBool,
}

impl RedbEngine {
    /// Opens (or creates) the engine at the given file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened, or if
    /// another process holds it.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let db = Database::create(path).map_err(EngineError::backend)?;

        // Make sure the table exists so read views never race its
        // creation.
        let txn = db.begin_write().map_err(EngineError::backend)?;
        txn.open_table(TABLE).map_err(EngineError::backend)?;
        txn.commit().map_err(EngineError::backend)?;

        Ok(Self {
            db,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

impl KvEngine for RedbEngine {
    fn view(&self) -> EngineResult<Box<dyn ReadView>> {
        self.check_open()?;
        let txn = self.db.begin_read().map_err(EngineError::backend)?;
        let table = txn.open_table(TABLE).map_err(EngineError::backend)?;
        Ok(Box::new(RedbView { table }))
    }

    fn apply(&self, batch: WriteBatch) -> EngineResult<()> {
        self.check_open()?;
        let txn = self.db.begin_write().map_err(EngineError::backend)?;
        {
            let mut table = txn.open_table(TABLE).map_err(EngineError::backend)?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(EngineError::backend)?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_slice()).map_err(EngineError::backend)?;
                    }
                }
            }
        }
        txn.commit().map_err(EngineError::backend)?;
        Ok(())
    }

    fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A snapshot view holding a `redb` read transaction's table.
///
/// `ReadOnlyTable` pins the MVCC snapshot for as long as the view lives,
/// which is what file handles rely on.
struct RedbView {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
}

impl ReadView for RedbView {
    fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let value = self.table.get(key).map_err(EngineError::backend)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn scan(&self, from: &[u8], prefix: &[u8], limit: usize) -> EngineResult<ScanPage> {
        let mut page = ScanPage::default();
        for item in self.table.range(from..).map_err(EngineError::backend)? {
            let (key_guard, value_guard) = item.map_err(EngineError::backend)?;
            let key = key_guard.value();
            if !key.starts_with(prefix) {
                break;
            }
            if page.entries.len() == limit {
                page.more = true;
                break;
            }
            page.entries
                .push((key.to_vec(), value_guard.value().to_vec()));
        }
        Ok(page)
    }

    fn scan_keys(&self, from: &[u8], prefix: &[u8], limit: usize) -> EngineResult<KeyPage> {
        let mut page = KeyPage::default();
        for item in self.table.range(from..).map_err(EngineError::backend)? {
            let (key_guard, _) = item.map_err(EngineError::backend)?;
            let key = key_guard.value();
            if !key.starts_with(prefix) {
                break;
            }
            if page.keys.len() == limit {
                page.more = true;
                break;
            }
            page.keys.push(key.to_vec());
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, RedbEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = RedbEngine::open(dir.path().join("store.redb")).unwrap();
        (dir, engine)
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let engine = RedbEngine::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(b"k".to_vec(), b"v".to_vec());
            engine.apply(batch).unwrap();
            engine.close().unwrap();
        }
        let engine = RedbEngine::open(&path).unwrap();
        let view = engine.view().unwrap();
        assert_eq!(view.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn batch_is_atomic_over_puts_and_deletes() {
        let (_dir, engine) = scratch();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        engine.apply(batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete(b"a".to_vec());
        batch.put(b"c".to_vec(), b"3".to_vec());
        engine.apply(batch).unwrap();

        let view = engine.view().unwrap();
        assert_eq!(view.get(b"a").unwrap(), None);
        assert_eq!(view.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(view.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn view_is_pinned_snapshot() {
        let (_dir, engine) = scratch();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"old".to_vec());
        engine.apply(batch).unwrap();

        let view = engine.view().unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"new".to_vec());
        engine.apply(batch).unwrap();

        assert_eq!(view.get(b"k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn scan_pages_in_key_order() {
        let (_dir, engine) = scratch();
        let mut batch = WriteBatch::new();
        for i in 0u8..5 {
            batch.put(vec![7, i], vec![i]);
        }
        batch.put(vec![8, 0], vec![0xAA]);
        engine.apply(batch).unwrap();

        let view = engine.view().unwrap();
        let mut seen = Vec::new();
        let mut from = vec![7];
        loop {
            let page = view.scan(&from, &[7], 2).unwrap();
            for (k, _) in &page.entries {
                seen.push(k.clone());
            }
            if !page.more {
                break;
            }
            from = crate::next_key(seen.last().unwrap());
        }
        assert_eq!(seen, (0u8..5).map(|i| vec![7, i]).collect::<Vec<_>>());
    }
}
