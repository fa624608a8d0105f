//! Database facade.

use crate::backup;
use crate::collection::Collection;
use crate::config::Config;
use crate::crypto::{Cipher, MasterKey};
use crate::error::{Error, Result};
use crate::file::{spawn_reaper, FileStore, HandleRegistry};
use crate::index::IndexAdapter;
use crate::keys;
use crate::transaction::{spawn_coordinator, Operation, WriteQueue};
use crate::ttl::{spawn_ttl_worker, TtlSignal};
use parking_lot::{Mutex, RwLock};
use sealdb_engine::{KvEngine, MemoryEngine, ReadView, RedbEngine, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Name of the engine file inside the database directory.
const ENGINE_FILE: &str = "sealdb.redb";

/// Version of the sealed config blob layout.
const SCHEMA_VERSION: u32 = 1;

/// Deadline for the single transaction that rewrites the whole key
/// space during a key rotation.
const UPDATE_KEY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Keys deleted per request when dropping a collection.
const DELETE_COLLECTION_CHUNK: usize = 512;

/// Page size for full key-space scans.
const SCAN_PAGE: usize = 256;

/// The sealed configuration blob stored at engine key `[0]`.
///
/// It is the only value sealed under the user's master key; everything
/// else is sealed under the content key it wraps.
#[derive(Debug, Serialize, Deserialize)]
struct ConfigBlob {
    version: u32,
    content_key: Vec<u8>,
    collections: BTreeMap<String, [u8; 2]>,
}

/// State shared between the facade, collections, file stores and the
/// background threads.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) engine: Arc<dyn KvEngine>,
    /// Cipher wrapping the config blob (user's master key).
    pub(crate) master: RwLock<Cipher>,
    /// Cipher sealing every other value (random content key).
    pub(crate) content: RwLock<Cipher>,
    /// Raw content key, needed to rebuild the config blob.
    pub(crate) content_key: RwLock<MasterKey>,
    pub(crate) queue: WriteQueue,
    pub(crate) halted: Arc<AtomicBool>,
    pub(crate) collections: RwLock<BTreeMap<String, [u8; 2]>>,
    /// Registered index adapters, keyed by `(collection, index name)`.
    pub(crate) adapters: RwLock<HashMap<(String, String), Arc<dyn IndexAdapter>>>,
    /// Wakes the TTL worker when a nearer record was scheduled.
    pub(crate) ttl_notify: Mutex<Option<Sender<TtlSignal>>>,
    /// Serializes management operations (close, backup, load,
    /// update_key, delete_collection, index registration).
    pub(crate) mgmt: Mutex<()>,
    /// Open reader/writer handles, swept by the reaper thread.
    pub(crate) handles: HandleRegistry,
}

impl Shared {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Opens a snapshot read view on the engine.
    pub(crate) fn view(&self) -> Result<Box<dyn ReadView>> {
        self.check_open()?;
        Ok(self.engine.view()?)
    }

    /// Seals a value under the content key, bound to its engine key.
    pub(crate) fn seal(&self, engine_key: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
        self.content.read().seal(engine_key, plain)
    }

    /// Opens a value sealed under the content key.
    pub(crate) fn open_value(&self, engine_key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        self.content.read().open(engine_key, sealed)
    }

    /// Tells the TTL worker to recompute its wake-up time.
    pub(crate) fn notify_ttl(&self) {
        if let Some(tx) = self.ttl_notify.lock().as_ref() {
            let _ = tx.send(TtlSignal::Recheck);
        }
    }

    /// Returns the 2-byte prefix of `name`, registering the collection
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HashCollision`] when the name's prefix collides
    /// with a different existing collection.
    pub(crate) fn collection_prefix_for(&self, name: &str) -> Result<[u8; 2]> {
        if name.is_empty() {
            return Err(Error::EmptyId);
        }
        if let Some(prefix) = self.collections.read().get(name) {
            return Ok(*prefix);
        }

        let prefix = keys::collection_prefix(name);
        {
            let mut registry = self.collections.write();
            // Raced registration is fine as long as it was the same
            // name.
            if let Some(existing) = registry.get(name) {
                return Ok(*existing);
            }
            if registry.values().any(|existing| *existing == prefix) {
                return Err(Error::HashCollision {
                    name: name.to_string(),
                });
            }
            registry.insert(name.to_string(), prefix);
        }

        let persisted = self.config_blob_op().and_then(|op| self.queue.submit(vec![op]));
        if let Err(err) = persisted {
            self.collections.write().remove(name);
            return Err(err);
        }
        debug!(collection = name, "registered collection");
        Ok(prefix)
    }

    /// Builds the put operation persisting the current config blob.
    pub(crate) fn config_blob_op(&self) -> Result<Operation> {
        let blob = ConfigBlob {
            version: SCHEMA_VERSION,
            content_key: self.content_key.read().as_bytes().to_vec(),
            collections: self.collections.read().clone(),
        };
        let key = keys::config_key();
        let sealed = self.master.read().seal(&key, &serde_json::to_vec(&blob)?)?;
        Ok(Operation::put(key, sealed))
    }
}

/// The main database handle.
///
/// `Database` is the entry point: it owns the engine, the write
/// coordinator and the background workers, and hands out [`Collection`]
/// and [`FileStore`] facades.
///
/// # Opening a database
///
/// ```rust,ignore
/// use sealdb_core::{Config, Database, MasterKey};
///
/// let config = Config::new("my_database", MasterKey::generate());
/// let db = Database::open(config)?;
///
/// let users = db.collection("users")?;
/// users.put("u1", &serde_json::json!({"name": "alice"}))?;
///
/// db.close()?;
/// ```
///
/// # In-memory databases
///
/// For testing, use [`Database::open_in_memory`].
pub struct Database {
    shared: Arc<Shared>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    ttl_worker: Mutex<Option<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (or creates) a persistent database in `config.path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthFailure`] when the directory holds a store
    /// created with a different master key.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        let engine = RedbEngine::open(config.path.join(ENGINE_FILE))?;
        Self::open_with_engine(config, Arc::new(engine))
    }

    /// Opens an ephemeral database for testing.
    pub fn open_in_memory(config: Config) -> Result<Self> {
        Self::open_with_engine(config, Arc::new(MemoryEngine::new()))
    }

    /// Opens a database on a caller-provided engine.
    pub fn open_with_engine(config: Config, engine: Arc<dyn KvEngine>) -> Result<Self> {
        let master = Cipher::new(&config.master_key);

        // Load or create the config blob. The coordinator is not
        // running yet, so the creation write goes straight to the
        // engine.
        let config_key = keys::config_key();
        let existing = engine.view()?.get(&config_key)?;
        let (content_key, collections) = match existing {
            Some(sealed) => {
                let plain = master.open(&config_key, &sealed)?;
                let blob: ConfigBlob = serde_json::from_slice(&plain)?;
                (MasterKey::from_bytes(&blob.content_key)?, blob.collections)
            }
            None => {
                let content_key = MasterKey::generate();
                let blob = ConfigBlob {
                    version: SCHEMA_VERSION,
                    content_key: content_key.as_bytes().to_vec(),
                    collections: BTreeMap::new(),
                };
                let sealed = master.seal(&config_key, &serde_json::to_vec(&blob)?)?;
                let mut batch = WriteBatch::new();
                batch.put(config_key, sealed);
                engine.apply(batch)?;
                (content_key, BTreeMap::new())
            }
        };

        let halted = Arc::new(AtomicBool::new(false));
        let (queue, queue_rx) = WriteQueue::new(
            config.queue_depth,
            config.transaction_timeout,
            Arc::clone(&halted),
        );

        let content = Cipher::new(&content_key);
        let shared = Arc::new(Shared {
            config,
            engine: Arc::clone(&engine),
            master: RwLock::new(master),
            content: RwLock::new(content),
            content_key: RwLock::new(content_key),
            queue,
            halted: Arc::clone(&halted),
            collections: RwLock::new(collections),
            adapters: RwLock::new(HashMap::new()),
            ttl_notify: Mutex::new(None),
            mgmt: Mutex::new(()),
            handles: HandleRegistry::new(),
        });

        let coordinator = spawn_coordinator(engine, queue_rx, halted);

        let (ttl_tx, ttl_rx) = mpsc::channel();
        *shared.ttl_notify.lock() = Some(ttl_tx);
        let ttl_worker = spawn_ttl_worker(Arc::clone(&shared), ttl_rx);

        let reaper = spawn_reaper(Arc::clone(&shared));

        Ok(Self {
            shared,
            coordinator: Mutex::new(Some(coordinator)),
            ttl_worker: Mutex::new(Some(ttl_worker)),
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Returns (registering on first use) the named collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HashCollision`] when the name's 2-byte prefix
    /// collides with a different existing collection.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.shared.check_open()?;
        let prefix = self.shared.collection_prefix_for(name)?;
        Ok(Collection::new(Arc::clone(&self.shared), name, prefix))
    }

    /// Returns the file store facade.
    #[must_use]
    pub fn file_store(&self) -> FileStore {
        FileStore::new(Arc::clone(&self.shared))
    }

    /// Names of all registered collections.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        self.shared.collections.read().keys().cloned().collect()
    }

    /// Drops a collection: every document, version record, index
    /// metadata record and related-file list under its prefix.
    ///
    /// Management operation - must not run concurrently with traffic.
    pub fn delete_collection(&self, name: &str) -> Result<()> {
        let _guard = self.shared.mgmt.lock();
        self.shared.check_open()?;

        let Some(prefix) = self.shared.collections.read().get(name).copied() else {
            return Err(Error::NotFound);
        };

        let view = self.shared.view()?;
        for scope in [keys::collection_scope(prefix), keys::related_scope(prefix)] {
            let mut from = scope.clone();
            loop {
                let page = view.scan_keys(&from, &scope, DELETE_COLLECTION_CHUNK)?;
                if page.keys.is_empty() {
                    break;
                }
                from = sealdb_engine::next_key(page.keys.last().expect("non-empty page"));
                let more = page.more;
                let ops = page.keys.into_iter().map(Operation::delete).collect();
                self.shared.queue.submit(ops)?;
                if !more {
                    break;
                }
            }
        }

        self.shared.collections.write().remove(name);
        self.shared
            .adapters
            .write()
            .retain(|(collection, _), _| collection != name);
        let blob_op = self.shared.config_blob_op()?;
        self.shared.queue.submit(vec![blob_op])?;
        Ok(())
    }

    /// Rotates the encryption keys.
    ///
    /// Re-seals every value under a fresh content key inside a single
    /// coordinator transaction and rewraps the config blob under
    /// `new_master`. After this returns, reopening requires
    /// `new_master`; the previous master key fails with
    /// [`Error::AuthFailure`].
    ///
    /// Management operation - must not run concurrently with traffic.
    pub fn update_key(&self, new_master: MasterKey) -> Result<()> {
        let _guard = self.shared.mgmt.lock();
        self.shared.check_open()?;

        let new_content = MasterKey::generate();
        let new_content_cipher = Cipher::new(&new_content);
        let new_master_cipher = Cipher::new(&new_master);

        let view = self.shared.view()?;
        let mut ops = Vec::new();
        let mut from = Vec::new();
        loop {
            let page = view.scan(&from, &[], SCAN_PAGE)?;
            let Some(last) = page.entries.last() else {
                break;
            };
            from = sealdb_engine::next_key(&last.0);
            for (key, sealed) in page.entries {
                if key == keys::config_key() {
                    continue;
                }
                let plain = self.shared.open_value(&key, &sealed)?;
                let resealed = new_content_cipher.seal(&key, &plain)?;
                ops.push(Operation::put(key, resealed));
            }
            if !page.more {
                break;
            }
        }

        let blob = ConfigBlob {
            version: SCHEMA_VERSION,
            content_key: new_content.as_bytes().to_vec(),
            collections: self.shared.collections.read().clone(),
        };
        let config_key = keys::config_key();
        let sealed_blob = new_master_cipher.seal(&config_key, &serde_json::to_vec(&blob)?)?;
        ops.push(Operation::put(config_key, sealed_blob));

        self.shared
            .queue
            .submit_until(ops, Instant::now() + UPDATE_KEY_TIMEOUT)?;

        *self.shared.master.write() = new_master_cipher;
        *self.shared.content.write() = new_content_cipher;
        *self.shared.content_key.write() = new_content;
        debug!("encryption keys rotated");
        Ok(())
    }

    /// Streams the whole (already encrypted) engine state to `writer`.
    ///
    /// Restoring requires the same master key. Management operation -
    /// must not run concurrently with traffic.
    pub fn backup(&self, writer: &mut dyn Write) -> Result<u64> {
        let _guard = self.shared.mgmt.lock();
        self.shared.check_open()?;
        backup::stream_out(&self.shared, writer)
    }

    /// Loads a backup stream produced by [`Database::backup`].
    ///
    /// Existing keys are overwritten. Management operation - must not
    /// run concurrently with traffic.
    pub fn load(&self, reader: &mut dyn Read) -> Result<u64> {
        let _guard = self.shared.mgmt.lock();
        self.shared.check_open()?;
        let count = backup::stream_in(&self.shared, reader)?;

        // The stream may carry another store's config blob; reload the
        // collection table and content key from what is now on disk.
        let config_key = keys::config_key();
        let sealed = self
            .shared
            .view()?
            .get(&config_key)?
            .ok_or(Error::NotFound)?;
        let plain = self.shared.master.read().open(&config_key, &sealed)?;
        let blob: ConfigBlob = serde_json::from_slice(&plain)?;
        let content_key = MasterKey::from_bytes(&blob.content_key)?;
        *self.shared.content.write() = Cipher::new(&content_key);
        *self.shared.content_key.write() = content_key;
        *self.shared.collections.write() = blob.collections;
        Ok(count)
    }

    /// Closes the database: stops the background workers, shuts the
    /// write pipeline down and releases the engine.
    ///
    /// Idempotent. Operations on facades obtained earlier fail with
    /// [`Error::Closed`] afterwards.
    pub fn close(&self) -> Result<()> {
        let _guard = self.shared.mgmt.lock();
        if self.shared.halted.load(Ordering::Acquire) {
            return Ok(());
        }

        // Stop intake first so the workers below cannot enqueue more.
        self.shared.handles.shutdown();
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }

        drop(self.shared.ttl_notify.lock().take());
        if let Some(handle) = self.ttl_worker.lock().take() {
            let _ = handle.join();
        }

        self.shared.queue.shutdown();
        if let Some(handle) = self.coordinator.lock().take() {
            let _ = handle.join();
        }

        self.shared.engine.close()?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Registers an index adapter in the shared registry; used by
/// `Collection::set_index` and `Collection::attach_index`.
pub(crate) fn register_adapter(
    shared: &Shared,
    collection: &str,
    index: &str,
    adapter: Arc<dyn IndexAdapter>,
) {
    shared
        .adapters
        .write()
        .insert((collection.to_string(), index.to_string()), adapter);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Database {
        let config = Config::new("/unused", MasterKey::generate());
        Database::open_in_memory(config).unwrap()
    }

    #[test]
    fn document_round_trip() {
        let db = memory_db();
        let col = db.collection("first collection name").unwrap();

        col.put_raw("u1", br#"{"name":"alice"}"#).unwrap();
        assert_eq!(col.get_raw("u1").unwrap(), br#"{"name":"alice"}"#);

        col.delete("u1").unwrap();
        assert!(matches!(col.get_raw("u1"), Err(Error::NotFound)));
    }

    #[test]
    fn empty_names_are_rejected() {
        let db = memory_db();
        assert!(matches!(db.collection(""), Err(Error::EmptyId)));
        let col = db.collection("col").unwrap();
        assert!(matches!(col.put_raw("", b"x"), Err(Error::EmptyId)));
        assert!(matches!(col.get_raw(""), Err(Error::EmptyId)));
    }

    #[test]
    fn collection_prefix_collision_is_fatal() {
        let db = memory_db();

        // Hunt for two names whose 2-byte prefixes collide; with a
        // 16-bit space a few hundred candidates are plenty.
        let mut seen: std::collections::HashMap<[u8; 2], String> = std::collections::HashMap::new();
        let (first, second) = 'found: {
            for i in 0..10_000u32 {
                let name = format!("collection-{i}");
                let prefix = keys::collection_prefix(&name);
                if let Some(existing) = seen.get(&prefix) {
                    break 'found (existing.clone(), name);
                }
                seen.insert(prefix, name);
            }
            panic!("no colliding collection names found");
        };

        db.collection(&first).unwrap();
        assert!(matches!(
            db.collection(&second),
            Err(Error::HashCollision { .. })
        ));
    }

    #[test]
    fn collections_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = MasterKey::generate();

        {
            let db = Database::open(Config::new(dir.path(), key.clone())).unwrap();
            let col = db.collection("users").unwrap();
            col.put_raw("u1", b"payload").unwrap();
            db.close().unwrap();
        }

        let db = Database::open(Config::new(dir.path(), key)).unwrap();
        assert_eq!(db.collections(), vec!["users".to_string()]);
        let col = db.collection("users").unwrap();
        assert_eq!(col.get_raw("u1").unwrap(), b"payload");
    }

    #[test]
    fn wrong_master_key_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(Config::new(dir.path(), MasterKey::generate())).unwrap();
            db.collection("users").unwrap();
            db.close().unwrap();
        }

        let err = Database::open(Config::new(dir.path(), MasterKey::generate())).unwrap_err();
        assert!(matches!(err, Error::AuthFailure));
    }

    #[test]
    fn key_rotation_reseals_everything() {
        let dir = tempfile::tempdir().unwrap();
        let old_key = MasterKey::generate();
        let new_key = MasterKey::generate();

        {
            let db = Database::open(Config::new(dir.path(), old_key.clone())).unwrap();
            let col = db.collection("users").unwrap();
            col.put_raw("u1", b"before rotation").unwrap();
            db.update_key(new_key.clone()).unwrap();
            db.close().unwrap();
        }

        // The old key no longer opens the store.
        let err = Database::open(Config::new(dir.path(), old_key)).unwrap_err();
        assert!(matches!(err, Error::AuthFailure));

        // The new key does, and prior values are intact.
        let db = Database::open(Config::new(dir.path(), new_key)).unwrap();
        let col = db.collection("users").unwrap();
        assert_eq!(col.get_raw("u1").unwrap(), b"before rotation");
    }

    #[test]
    fn delete_collection_drops_every_key() {
        let db = memory_db();
        let col = db.collection("doomed").unwrap();
        col.put_raw("a", b"1").unwrap();
        col.put_raw("b", b"2").unwrap();

        db.delete_collection("doomed").unwrap();
        assert!(db.collections().is_empty());

        // Re-registering starts from a clean slate.
        let col = db.collection("doomed").unwrap();
        assert!(matches!(col.get_raw("a"), Err(Error::NotFound)));
        assert!(matches!(col.history_raw("a", 10), Err(Error::NotFound)));
    }

    #[test]
    fn operations_after_close_fail() {
        let db = memory_db();
        let col = db.collection("users").unwrap();
        db.close().unwrap();
        assert!(matches!(col.put_raw("u1", b"x"), Err(Error::Closed)));
        assert!(matches!(db.collection("other"), Err(Error::Closed)));
    }

    #[test]
    fn close_is_idempotent() {
        let db = memory_db();
        db.close().unwrap();
        db.close().unwrap();
    }
}
