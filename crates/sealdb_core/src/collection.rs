//! Collections of documents.

use crate::database::{register_adapter, Shared};
use crate::error::{Error, Result};
use crate::file;
use crate::index::{IndexAdapter, IndexMeta};
use crate::keys;
use crate::transaction::Operation;
use crate::ttl::{self, TtlTarget};
use sealdb_engine::ReadView;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Page size when scanning a document's version records.
const HISTORY_PAGE: usize = 64;

/// A named collection of documents.
///
/// Documents are byte payloads addressed by caller-chosen string ids.
/// The typed methods (`put`, `get`, `history`) serialize through JSON
/// as a convenience; `*_raw` variants work on bytes directly.
///
/// Every put also writes a version record in the same transaction, so
/// [`Collection::history`] can return earlier payloads.
///
/// # Example
///
/// ```rust,ignore
/// let users = db.collection("users")?;
/// users.put("u1", &User { name: "alice".into() })?;
/// let user: User = users.get("u1")?;
/// users.delete("u1")?;
/// ```
pub struct Collection {
    shared: Arc<Shared>,
    name: String,
    prefix: [u8; 2],
}

impl Collection {
    pub(crate) fn new(shared: Arc<Shared>, name: &str, prefix: [u8; 2]) -> Self {
        Self {
            shared,
            name: name.to_string(),
            prefix,
        }
    }

    /// The collection's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores `value` under `id`, overwriting any previous version.
    pub fn put<T: Serialize>(&self, id: &str, value: &T) -> Result<()> {
        self.put_raw(id, &serde_json::to_vec(value)?)
    }

    /// Stores raw bytes under `id`.
    pub fn put_raw(&self, id: &str, body: &[u8]) -> Result<()> {
        let ops = self.put_ops(id, body, false)?;
        self.shared.queue.submit(ops)?;
        self.fan_out_put(id, body);
        Ok(())
    }

    /// Stores `value` and drops every earlier version in the same
    /// transaction, so the history afterwards contains exactly this
    /// version.
    pub fn put_with_clean_history<T: Serialize>(&self, id: &str, value: &T) -> Result<()> {
        self.put_raw_with_clean_history(id, &serde_json::to_vec(value)?)
    }

    /// Raw-bytes variant of [`Collection::put_with_clean_history`].
    pub fn put_raw_with_clean_history(&self, id: &str, body: &[u8]) -> Result<()> {
        let ops = self.put_ops(id, body, true)?;
        self.shared.queue.submit(ops)?;
        self.fan_out_put(id, body);
        Ok(())
    }

    /// Stores `value` and schedules its deletion after `ttl`.
    pub fn put_with_ttl<T: Serialize>(&self, id: &str, value: &T, ttl: Duration) -> Result<()> {
        self.put_raw_with_ttl(id, &serde_json::to_vec(value)?, ttl)
    }

    /// Raw-bytes variant of [`Collection::put_with_ttl`].
    ///
    /// The TTL record is written in the same transaction as the
    /// document; when it fires, the document and the record are deleted
    /// together.
    pub fn put_raw_with_ttl(&self, id: &str, body: &[u8], ttl: Duration) -> Result<()> {
        let mut ops = self.put_ops(id, body, false)?;
        let target = TtlTarget {
            collection: Some(self.name.clone()),
            id: id.to_string(),
            is_file: false,
        };
        ops.push(ttl::schedule_op(&self.shared, &target, ttl)?);
        self.shared.queue.submit(ops)?;
        self.shared.notify_ttl();
        self.fan_out_put(id, body);
        Ok(())
    }

    /// Retrieves and deserializes the document stored under `id`.
    pub fn get<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.get_raw(id)?)?)
    }

    /// Retrieves the raw bytes stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no document exists under `id`.
    pub fn get_raw(&self, id: &str) -> Result<Vec<u8>> {
        check_id(id)?;
        let key = keys::document_key(self.prefix, id);
        let view = self.shared.view()?;
        let sealed = view.get(&key)?.ok_or(Error::NotFound)?;
        self.shared.open_value(&key, &sealed)
    }

    /// Deletes the document under `id`, its version records, and every
    /// file related to it.
    ///
    /// Idempotent: deleting an absent document is not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        check_id(id)?;
        let view = self.shared.view()?;

        let mut ops = vec![Operation::delete(keys::document_key(self.prefix, id))];
        for key in self.history_keys(view.as_ref(), id)? {
            ops.push(Operation::delete(key));
        }

        // Cascade: every file whose metadata references this document,
        // then the back-reference list itself, in the same transaction.
        let related = file::read_related_ids(&self.shared, view.as_ref(), self.prefix, id)?;
        for file_id in &related {
            ops.extend(file::delete_file_ops(view.as_ref(), file_id)?);
        }
        ops.push(Operation::delete(keys::related_key(self.prefix, id)));

        self.shared.queue.submit(ops)?;
        self.fan_out_delete(id);
        Ok(())
    }

    /// Returns up to `limit` stored versions of `id`, newest first,
    /// deserialized.
    pub fn history<T: DeserializeOwned>(&self, id: &str, limit: usize) -> Result<Vec<T>> {
        self.history_raw(id, limit)?
            .iter()
            .map(|body| Ok(serde_json::from_slice(body)?))
            .collect()
    }

    /// Returns up to `limit` stored versions of `id`, newest first.
    pub fn history_raw(&self, id: &str, limit: usize) -> Result<Vec<Vec<u8>>> {
        check_id(id)?;
        let view = self.shared.view()?;
        let mut payload_keys = self.history_keys(view.as_ref(), id)?;
        if payload_keys.is_empty() {
            return Err(Error::NotFound);
        }

        let newest = payload_keys.split_off(payload_keys.len().saturating_sub(limit));
        let mut versions = Vec::with_capacity(newest.len());
        for key in newest.into_iter().rev() {
            let sealed = view.get(&key)?.ok_or(Error::NotFound)?;
            versions.push(self.shared.open_value(&key, &sealed)?);
        }
        Ok(versions)
    }

    /// Registers an index on this collection.
    ///
    /// The mapping bytes are opaque to the database; their fingerprint
    /// is stored so conflicting re-registrations are detected.
    ///
    /// # Errors
    ///
    /// - [`Error::IndexAlreadyExists`] when the index was already
    ///   registered with the same mapping
    /// - [`Error::IndexMappingMismatch`] when it exists with a
    ///   different mapping
    /// - [`Error::HashCollision`] when the name's posting prefix
    ///   collides with another index of this collection
    pub fn set_index(
        &self,
        index_name: &str,
        mapping: &[u8],
        adapter: Arc<dyn IndexAdapter>,
    ) -> Result<()> {
        let _guard = self.shared.mgmt.lock();
        self.shared.check_open()?;
        check_id(index_name)?;

        let meta = IndexMeta::new(index_name, mapping);
        let meta_key = keys::index_meta_key(self.prefix, index_name);
        let view = self.shared.view()?;

        if let Some(sealed) = view.get(&meta_key)? {
            let existing: IndexMeta =
                serde_json::from_slice(&self.shared.open_value(&meta_key, &sealed)?)?;
            if existing.mapping_fingerprint == meta.mapping_fingerprint {
                return Err(Error::IndexAlreadyExists {
                    name: index_name.to_string(),
                });
            }
            return Err(Error::IndexMappingMismatch {
                name: index_name.to_string(),
            });
        }

        // The posting prefix is derived from a hash of the name; a
        // collision with a different index is fatal for this name.
        let scope = keys::index_meta_prefix(self.prefix);
        let mut from = scope.clone();
        loop {
            let page = view.scan(&from, &scope, HISTORY_PAGE)?;
            for (key, sealed) in &page.entries {
                let other: IndexMeta =
                    serde_json::from_slice(&self.shared.open_value(key, sealed)?)?;
                if other.posting_prefix == meta.posting_prefix && other.name != index_name {
                    return Err(Error::HashCollision {
                        name: index_name.to_string(),
                    });
                }
            }
            match page.entries.last() {
                Some(last) if page.more => from = sealdb_engine::next_key(&last.0),
                _ => break,
            }
        }

        let sealed = self.shared.seal(&meta_key, &serde_json::to_vec(&meta)?)?;
        self.shared
            .queue
            .submit(vec![Operation::put(meta_key, sealed)])?;
        register_adapter(&self.shared, &self.name, index_name, adapter);
        Ok(())
    }

    /// Re-attaches an adapter to an index registered in an earlier
    /// session.
    pub fn attach_index(&self, index_name: &str, adapter: Arc<dyn IndexAdapter>) -> Result<()> {
        self.shared.check_open()?;
        let meta_key = keys::index_meta_key(self.prefix, index_name);
        if self.shared.view()?.get(&meta_key)?.is_none() {
            return Err(Error::IndexNotFound {
                name: index_name.to_string(),
            });
        }
        register_adapter(&self.shared, &self.name, index_name, adapter);
        Ok(())
    }

    /// Removes an index registration and detaches its adapter.
    pub fn delete_index(&self, index_name: &str) -> Result<()> {
        let _guard = self.shared.mgmt.lock();
        self.shared.check_open()?;

        let meta_key = keys::index_meta_key(self.prefix, index_name);
        if self.shared.view()?.get(&meta_key)?.is_none() {
            return Err(Error::IndexNotFound {
                name: index_name.to_string(),
            });
        }
        self.shared
            .queue
            .submit(vec![Operation::delete(meta_key)])?;
        self.shared
            .adapters
            .write()
            .remove(&(self.name.clone(), index_name.to_string()));
        Ok(())
    }

    /// Runs an opaque query against the named index and resolves the
    /// candidate ids into documents.
    ///
    /// At most `internal_query_limit` candidates are considered.
    pub fn query(&self, index_name: &str, request: &[u8]) -> Result<QueryResult> {
        let adapter = self
            .shared
            .adapters
            .read()
            .get(&(self.name.clone(), index_name.to_string()))
            .cloned()
            .ok_or_else(|| Error::IndexNotFound {
                name: index_name.to_string(),
            })?;

        let mut ids = adapter.query(request);
        ids.truncate(self.shared.config.internal_query_limit);

        let view = self.shared.view()?;
        let mut hits = VecDeque::with_capacity(ids.len());
        for id in ids {
            let key = keys::document_key(self.prefix, &id);
            // A candidate deleted since it was indexed is skipped, not
            // an error.
            if let Some(sealed) = view.get(&key)? {
                let body = self.shared.open_value(&key, &sealed)?;
                hits.push_back(QueryHit { id, body });
            }
        }
        Ok(QueryResult { hits })
    }

    /// Builds the operations of one put: the document body plus its
    /// version record, and with `clean_history` the deletion of every
    /// earlier version.
    fn put_ops(&self, id: &str, body: &[u8], clean_history: bool) -> Result<Vec<Operation>> {
        check_id(id)?;
        let view = self.shared.view()?;

        let doc_key = keys::document_key(self.prefix, id);
        let mut ops = Vec::with_capacity(2);
        ops.push(Operation::put(doc_key.clone(), self.shared.seal(&doc_key, body)?));

        let existing = self.history_keys(view.as_ref(), id)?;
        let counter = if clean_history {
            for key in existing {
                ops.push(Operation::delete(key));
            }
            1
        } else {
            existing
                .last()
                .and_then(|key| history_counter(key))
                .map_or(1, |last| last + 1)
        };

        let version_key = keys::history_key(self.prefix, id, counter);
        let sealed = self.shared.seal(&version_key, body)?;
        ops.push(Operation::put(version_key, sealed));
        Ok(ops)
    }

    /// All version-record keys of `id`, ascending by counter.
    fn history_keys(&self, view: &dyn ReadView, id: &str) -> Result<Vec<Vec<u8>>> {
        let prefix = keys::history_prefix(self.prefix, id);
        let mut out = Vec::new();
        let mut from = prefix.clone();
        loop {
            let page = view.scan_keys(&from, &prefix, HISTORY_PAGE)?;
            out.extend(page.keys);
            if !page.more {
                break;
            }
            from = sealdb_engine::next_key(out.last().expect("page with more has keys"));
        }
        Ok(out)
    }

    /// Adapters registered on this collection.
    fn collection_adapters(&self) -> Vec<Arc<dyn IndexAdapter>> {
        self.shared
            .adapters
            .read()
            .iter()
            .filter(|((collection, _), _)| collection == &self.name)
            .map(|(_, adapter)| Arc::clone(adapter))
            .collect()
    }

    /// Indexing happens strictly after the write committed.
    fn fan_out_put(&self, id: &str, body: &[u8]) {
        for adapter in self.collection_adapters() {
            adapter.on_put(&self.name, id, body);
        }
    }

    fn fan_out_delete(&self, id: &str) {
        for adapter in self.collection_adapters() {
            adapter.on_delete(&self.name, id);
        }
    }
}

/// One query hit: the document id and its body.
#[derive(Debug, Clone)]
pub struct QueryHit {
    /// The document id.
    pub id: String,
    /// The raw document body.
    pub body: Vec<u8>,
}

/// Resolved query hits, consumed front to back.
#[derive(Debug)]
pub struct QueryResult {
    hits: VecDeque<QueryHit>,
}

impl QueryResult {
    /// Number of remaining hits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether all hits have been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Returns the next hit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfQuery`] once every hit was consumed.
    pub fn next_hit(&mut self) -> Result<QueryHit> {
        self.hits.pop_front().ok_or(Error::EndOfQuery)
    }

    /// Returns the next hit deserialized into `T`.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<(String, T)> {
        let hit = self.next_hit()?;
        Ok((hit.id, serde_json::from_slice(&hit.body)?))
    }
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::EmptyId);
    }
    Ok(())
}

/// Parses the big-endian counter out of a version-record key.
fn history_counter(key: &[u8]) -> Option<u64> {
    let tail = key.len().checked_sub(8)?;
    let mut be = [0u8; 8];
    be.copy_from_slice(&key[tail..]);
    Some(u64::from_be_bytes(be))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::MasterKey;
    use crate::database::Database;
    use parking_lot::Mutex as PlMutex;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    fn memory_db() -> Database {
        Database::open_in_memory(Config::new("/unused", MasterKey::generate())).unwrap()
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
        age: u32,
    }

    /// Minimal in-memory adapter: remembers bodies and answers
    /// substring queries.
    struct SubstringIndex {
        docs: PlMutex<BTreeMap<String, Vec<u8>>>,
    }

    impl SubstringIndex {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                docs: PlMutex::new(BTreeMap::new()),
            })
        }
    }

    impl IndexAdapter for SubstringIndex {
        fn on_put(&self, _collection: &str, id: &str, body: &[u8]) {
            self.docs.lock().insert(id.to_string(), body.to_vec());
        }

        fn on_delete(&self, _collection: &str, id: &str) {
            self.docs.lock().remove(id);
        }

        fn query(&self, request: &[u8]) -> Vec<String> {
            self.docs
                .lock()
                .iter()
                .filter(|(_, body)| {
                    body.windows(request.len().max(1))
                        .any(|window| window == request)
                })
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[test]
    fn typed_round_trip() {
        let db = memory_db();
        let col = db.collection("users").unwrap();

        let alice = User {
            name: "alice".into(),
            age: 30,
        };
        col.put("u1", &alice).unwrap();
        assert_eq!(col.get::<User>("u1").unwrap(), alice);
    }

    #[test]
    fn history_returns_newest_first() {
        let db = memory_db();
        let col = db.collection("users").unwrap();

        col.put_raw("u1", b"v1").unwrap();
        col.put_raw("u1", b"v2").unwrap();
        col.put_raw("u1", b"v3").unwrap();

        let all = col.history_raw("u1", 10).unwrap();
        assert_eq!(all, vec![b"v3".to_vec(), b"v2".to_vec(), b"v1".to_vec()]);

        let bounded = col.history_raw("u1", 2).unwrap();
        assert_eq!(bounded, vec![b"v3".to_vec(), b"v2".to_vec()]);

        // The live document stays the newest version.
        assert_eq!(col.get_raw("u1").unwrap(), b"v3");
    }

    #[test]
    fn clean_history_leaves_exactly_one_version() {
        let db = memory_db();
        let col = db.collection("users").unwrap();

        col.put_raw("u1", b"v1").unwrap();
        col.put_raw("u1", b"v2").unwrap();
        col.put_raw_with_clean_history("u1", b"fresh").unwrap();

        assert_eq!(col.history_raw("u1", 10).unwrap(), vec![b"fresh".to_vec()]);
        assert_eq!(col.get_raw("u1").unwrap(), b"fresh");
    }

    #[test]
    fn delete_cascades_related_files() {
        let db = memory_db();
        let col = db.collection("posts").unwrap();
        let files = db.file_store();

        col.put_raw("post1", b"{}").unwrap();
        let mut media = &b"attached media bytes"[..];
        files
            .put_file_related("fileA", "media.bin", &mut media, "posts", "post1")
            .unwrap();

        let mut out = Vec::new();
        files.read_file("fileA", &mut out).unwrap();
        assert_eq!(out, b"attached media bytes");

        col.delete("post1").unwrap();

        let mut out = Vec::new();
        let streamed = files.read_file("fileA", &mut out).unwrap();
        assert_eq!(streamed, 0);
        assert!(out.is_empty());
        assert!(matches!(files.get_file_meta("fileA"), Err(Error::NotFound)));
    }

    #[test]
    fn query_resolves_ids_through_adapter() {
        let db = memory_db();
        let col = db.collection("users").unwrap();
        let index = SubstringIndex::new();
        col.set_index("name", b"substring-mapping", index).unwrap();

        col.put("u1", &User { name: "cindy".into(), age: 22 }).unwrap();
        col.put("u2", &User { name: "bob".into(), age: 41 }).unwrap();

        let mut result = col.query("name", b"cindy").unwrap();
        assert_eq!(result.len(), 1);
        let (id, user): (String, User) = result.next().unwrap();
        assert_eq!(id, "u1");
        assert_eq!(user.name, "cindy");
        assert!(matches!(result.next_hit(), Err(Error::EndOfQuery)));
    }

    #[test]
    fn query_skips_documents_deleted_after_indexing() {
        let db = memory_db();
        let col = db.collection("users").unwrap();
        let index = SubstringIndex::new();
        col.set_index("name", b"substring-mapping", Arc::clone(&index) as Arc<dyn IndexAdapter>)
            .unwrap();

        col.put("u1", &User { name: "cindy".into(), age: 22 }).unwrap();
        // Simulate an adapter lagging behind a delete.
        index.docs.lock().insert("ghost".into(), b"cindy".to_vec());

        let result = col.query("name", b"cindy").unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn index_registration_conflicts() {
        let db = memory_db();
        let col = db.collection("users").unwrap();

        col.set_index("email", b"mapping-v1", SubstringIndex::new())
            .unwrap();
        assert!(matches!(
            col.set_index("email", b"mapping-v1", SubstringIndex::new()),
            Err(Error::IndexAlreadyExists { .. })
        ));
        assert!(matches!(
            col.set_index("email", b"mapping-v2", SubstringIndex::new()),
            Err(Error::IndexMappingMismatch { .. })
        ));
    }

    #[test]
    fn attach_requires_registration() {
        let db = memory_db();
        let col = db.collection("users").unwrap();

        assert!(matches!(
            col.attach_index("missing", SubstringIndex::new()),
            Err(Error::IndexNotFound { .. })
        ));

        col.set_index("email", b"mapping", SubstringIndex::new())
            .unwrap();
        col.attach_index("email", SubstringIndex::new()).unwrap();
    }

    #[test]
    fn delete_index_detaches() {
        let db = memory_db();
        let col = db.collection("users").unwrap();
        col.set_index("email", b"mapping", SubstringIndex::new())
            .unwrap();

        col.delete_index("email").unwrap();
        assert!(matches!(
            col.query("email", b"x"),
            Err(Error::IndexNotFound { .. })
        ));
        assert!(matches!(
            col.delete_index("email"),
            Err(Error::IndexNotFound { .. })
        ));
    }
}
