//! Chunked file storage.
//!
//! Large payloads are split into fixed-size chunks, each sealed and
//! stored under its own engine key, with a metadata record at the
//! chunk-0 key. Byte-lexicographic iteration over a file's prefix
//! yields the metadata first and then the chunks in numeric order, so
//! streaming reads never buffer the whole file.

mod handle;

pub use handle::{FileReader, FileWriter};
pub(crate) use handle::{spawn_reaper, HandleRegistry};

use crate::database::Shared;
use crate::error::{Error, Result};
use crate::keys;
use crate::transaction::Operation;
use crate::ttl::{self, TtlTarget};
use sealdb_engine::ReadView;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Keys-only page size when enumerating a file's chunk keys.
const DELETE_PAGE: usize = 256;

/// Chunks decrypted per page while streaming a file out. Kept small:
/// every entry is a whole chunk.
const READ_PAGE: usize = 3;

/// Metadata of a stored file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    /// Caller-chosen file id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// Time of the last completed write.
    pub last_modified: SystemTime,
    /// Chunk size fixed at creation; every produced chunk has this
    /// length except the last.
    pub chunk_size: usize,
    /// Collection of the owning document, when the file is related.
    pub related_collection: Option<String>,
    /// Id of the owning document, when the file is related.
    pub related_document_id: Option<String>,
    /// True while a writer handle owns the file.
    pub in_write: bool,
}

impl FileMeta {
    fn new(id: &str, name: &str, chunk_size: usize) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            size: 0,
            last_modified: SystemTime::UNIX_EPOCH,
            chunk_size,
            related_collection: None,
            related_document_id: None,
            in_write: false,
        }
    }
}

/// Facade for storing and retrieving large files.
///
/// Obtained from [`crate::Database::file_store`].
pub struct FileStore {
    shared: Arc<Shared>,
}

impl FileStore {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Streams `reader` into the store under `id`, replacing any
    /// existing file with that id. Returns the number of bytes written.
    pub fn put_file(&self, id: &str, name: &str, reader: &mut dyn Read) -> Result<u64> {
        self.put_file_inner(id, name, reader, None)
    }

    /// Like [`FileStore::put_file`], but the file is deleted
    /// automatically when the related document is deleted.
    pub fn put_file_related(
        &self,
        id: &str,
        name: &str,
        reader: &mut dyn Read,
        collection: &str,
        document_id: &str,
    ) -> Result<u64> {
        self.put_file_inner(id, name, reader, Some((collection, document_id)))
    }

    /// Like [`FileStore::put_file`], but the file expires after `ttl`.
    pub fn put_file_with_ttl(
        &self,
        id: &str,
        name: &str,
        reader: &mut dyn Read,
        ttl: Duration,
    ) -> Result<u64> {
        let written = self.put_file_inner(id, name, reader, None)?;
        self.schedule_file_ttl(id, ttl)?;
        Ok(written)
    }

    fn put_file_inner(
        &self,
        id: &str,
        name: &str,
        reader: &mut dyn Read,
        related: Option<(&str, &str)>,
    ) -> Result<u64> {
        check_id(id)?;
        {
            let view = self.shared.view()?;
            if let Some(existing) = read_meta(&self.shared, view.as_ref(), id)? {
                if existing.in_write {
                    return Err(Error::FileInWrite);
                }
            }
        }
        // Overwrite semantics: a put on an existing id starts from a
        // clean slate so no stale chunks survive a shrink.
        self.delete_file(id)?;

        let chunk_size = self.shared.config.chunk_size;
        let mut meta = FileMeta::new(id, name, chunk_size);
        meta.in_write = true;

        if let Some((collection, document_id)) = related {
            let prefix = self.shared.collection_prefix_for(collection)?;
            meta.related_collection = Some(collection.to_string());
            meta.related_document_id = Some(document_id.to_string());
            add_related_file_id(&self.shared, prefix, document_id, id)?;
        }

        self.put_meta(&meta)?;

        let mut written: u64 = 0;
        let mut chunk_n: u64 = 1;
        let mut buf = vec![0u8; chunk_size];
        loop {
            let filled = read_full(reader, &mut buf)?;
            if filled == 0 {
                break;
            }
            let key = keys::file_chunk_key(id, chunk_n);
            let sealed = self.shared.seal(&key, &buf[..filled])?;
            self.shared.queue.submit(vec![Operation::put(key, sealed)])?;
            written += filled as u64;
            chunk_n += 1;
            if filled < chunk_size {
                break;
            }
        }

        meta.size = written;
        meta.last_modified = SystemTime::now();
        meta.in_write = false;
        self.put_meta(&meta)?;
        Ok(written)
    }

    /// Streams the file's content into `writer`, chunk by chunk.
    ///
    /// An unknown id streams zero bytes. Returns the number of bytes
    /// written.
    pub fn read_file(&self, id: &str, writer: &mut dyn Write) -> Result<u64> {
        check_id(id)?;
        let view = self.shared.view()?;
        let prefix = keys::file_prefix(id);
        let mut from = keys::file_chunk_key(id, 1);
        let mut total: u64 = 0;
        loop {
            let page = view.scan(&from, &prefix, READ_PAGE)?;
            for (key, sealed) in &page.entries {
                let chunk = self.shared.open_value(key, sealed)?;
                writer.write_all(&chunk)?;
                total += chunk.len() as u64;
            }
            match page.entries.last() {
                Some(last) if page.more => from = sealdb_engine::next_key(&last.0),
                _ => break,
            }
        }
        Ok(total)
    }

    /// Returns the metadata of the file stored under `id`.
    pub fn get_file_meta(&self, id: &str) -> Result<FileMeta> {
        check_id(id)?;
        let view = self.shared.view()?;
        read_meta(&self.shared, view.as_ref(), id)?.ok_or(Error::NotFound)
    }

    /// Opens a random-access reader positioned at the start of the
    /// file.
    ///
    /// The handle owns a snapshot view and auto-closes after the
    /// configured inactivity timeout.
    pub fn get_file_reader(&self, id: &str) -> Result<FileReader> {
        check_id(id)?;
        handle::open_reader(Arc::clone(&self.shared), id)
    }

    /// Opens a random-access writer positioned at the end of the file.
    ///
    /// Sets `in_write` on open; a second concurrent writer fails with
    /// [`Error::FileInWrite`]. The flag is cleared on close, drop, or
    /// when the inactivity timer fires.
    pub fn get_file_writer(&self, id: &str, name: &str) -> Result<FileWriter> {
        check_id(id)?;
        handle::open_writer(Arc::clone(&self.shared), id, name, None)
    }

    /// Like [`FileStore::get_file_writer`], with the file related to a
    /// document.
    pub fn get_file_writer_related(
        &self,
        id: &str,
        name: &str,
        collection: &str,
        document_id: &str,
    ) -> Result<FileWriter> {
        check_id(id)?;
        handle::open_writer(
            Arc::clone(&self.shared),
            id,
            name,
            Some((collection, document_id)),
        )
    }

    /// Like [`FileStore::get_file_writer`], with the file expiring
    /// after `ttl`.
    pub fn get_file_writer_with_ttl(
        &self,
        id: &str,
        name: &str,
        ttl: Duration,
    ) -> Result<FileWriter> {
        check_id(id)?;
        let writer = handle::open_writer(Arc::clone(&self.shared), id, name, None)?;
        self.schedule_file_ttl(id, ttl)?;
        Ok(writer)
    }

    /// Deletes the file's metadata and every chunk, then removes it
    /// from its document's related list.
    ///
    /// Idempotent: deleting an unknown id is not an error.
    pub fn delete_file(&self, id: &str) -> Result<()> {
        check_id(id)?;
        let view = self.shared.view()?;

        // The related pair has to be read before the metadata is gone.
        let meta = read_meta(&self.shared, view.as_ref(), id)?;

        let ops = delete_file_ops(view.as_ref(), id)?;
        if ops.is_empty() {
            return Ok(());
        }
        self.shared.queue.submit(ops)?;

        if let Some(meta) = meta {
            if let (Some(collection), Some(document_id)) =
                (meta.related_collection, meta.related_document_id)
            {
                if let Some(prefix) = self.shared.collections.read().get(&collection).copied() {
                    remove_related_file_id(&self.shared, prefix, &document_id, id)?;
                }
            }
        }
        Ok(())
    }

    /// Returns a lazy cursor over the metadata records of all stored
    /// files.
    pub fn file_iterator(&self) -> Result<FileIterator> {
        let view = self.shared.view()?;
        Ok(FileIterator {
            shared: Arc::clone(&self.shared),
            view,
            resume: vec![keys::PREFIX_FILES],
            exhausted: false,
        })
    }

    fn put_meta(&self, meta: &FileMeta) -> Result<()> {
        let key = keys::file_meta_key(&meta.id);
        let sealed = self.shared.seal(&key, &serde_json::to_vec(meta)?)?;
        self.shared.queue.submit(vec![Operation::put(key, sealed)])
    }

    fn schedule_file_ttl(&self, id: &str, ttl: Duration) -> Result<()> {
        let target = TtlTarget {
            collection: None,
            id: id.to_string(),
            is_file: true,
        };
        let op = ttl::schedule_op(&self.shared, &target, ttl)?;
        self.shared.queue.submit(vec![op])?;
        self.shared.notify_ttl();
        Ok(())
    }
}

/// Lazy cursor over file metadata records.
///
/// Chunk keys are filtered out by shape (34 bytes, `0x00` suffix), so
/// chunk payloads are never pulled into memory.
pub struct FileIterator {
    shared: Arc<Shared>,
    view: Box<dyn ReadView>,
    resume: Vec<u8>,
    exhausted: bool,
}

impl FileIterator {
    /// Positions the cursor at the metadata record of `id`; the next
    /// call to [`FileIterator::next`] returns it if the file exists.
    pub fn seek(&mut self, id: &str) {
        self.resume = keys::file_meta_key(id);
        self.exhausted = false;
    }

    /// Advances to the next metadata record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IteratorInvalid`] once the cursor moved past
    /// the last file.
    pub fn next(&mut self) -> Result<FileMeta> {
        let prefix = [keys::PREFIX_FILES];
        while !self.exhausted {
            let page = self.view.scan_keys(&self.resume, &prefix, DELETE_PAGE)?;
            let Some(last) = page.keys.last() else {
                break;
            };
            self.resume = sealdb_engine::next_key(last);
            self.exhausted = !page.more;

            for key in page.keys {
                if !keys::is_file_meta_key(&key) {
                    continue;
                }
                let Some(sealed) = self.view.get(&key)? else {
                    continue;
                };
                let body = self.shared.open_value(&key, &sealed)?;
                let meta: FileMeta = serde_json::from_slice(&body)?;
                // Resume right after this record next time.
                self.resume = sealdb_engine::next_key(&key);
                self.exhausted = false;
                return Ok(meta);
            }
        }
        self.exhausted = true;
        Err(Error::IteratorInvalid)
    }
}

/// Delete operations for every engine key under the file's prefix.
///
/// Shared by `delete_file`, the document-delete cascade and the TTL
/// worker so all three delete a file the same way.
pub(crate) fn delete_file_ops(view: &dyn ReadView, id: &str) -> Result<Vec<Operation>> {
    let prefix = keys::file_prefix(id);
    let mut ops = Vec::new();
    let mut from = prefix.clone();
    loop {
        let page = view.scan_keys(&from, &prefix, DELETE_PAGE)?;
        let Some(last) = page.keys.last() else {
            break;
        };
        from = sealdb_engine::next_key(last);
        let more = page.more;
        ops.extend(page.keys.into_iter().map(Operation::delete));
        if !more {
            break;
        }
    }
    Ok(ops)
}

/// Reads the decoded related-file list of `(collection, document)`.
pub(crate) fn read_related_ids(
    shared: &Shared,
    view: &dyn ReadView,
    prefix: [u8; 2],
    document_id: &str,
) -> Result<Vec<String>> {
    let key = keys::related_key(prefix, document_id);
    match view.get(&key)? {
        Some(sealed) => {
            let body = shared.open_value(&key, &sealed)?;
            Ok(serde_json::from_slice(&body)?)
        }
        None => Ok(Vec::new()),
    }
}

/// Appends `file_id` to the related list of `(collection, document)`.
pub(crate) fn add_related_file_id(
    shared: &Shared,
    prefix: [u8; 2],
    document_id: &str,
    file_id: &str,
) -> Result<()> {
    let view = shared.view()?;
    let mut ids = read_related_ids(shared, view.as_ref(), prefix, document_id)?;
    if !ids.iter().any(|existing| existing == file_id) {
        ids.push(file_id.to_string());
    }
    let key = keys::related_key(prefix, document_id);
    let sealed = shared.seal(&key, &serde_json::to_vec(&ids)?)?;
    shared.queue.submit(vec![Operation::put(key, sealed)])
}

/// Removes `file_id` from the related list; an emptied list is deleted
/// outright.
pub(crate) fn remove_related_file_id(
    shared: &Shared,
    prefix: [u8; 2],
    document_id: &str,
    file_id: &str,
) -> Result<()> {
    let view = shared.view()?;
    let mut ids = read_related_ids(shared, view.as_ref(), prefix, document_id)?;
    ids.retain(|existing| existing != file_id);

    let key = keys::related_key(prefix, document_id);
    let op = if ids.is_empty() {
        Operation::delete(key)
    } else {
        let sealed = shared.seal(&key, &serde_json::to_vec(&ids)?)?;
        Operation::put(key, sealed)
    };
    shared.queue.submit(vec![op])
}

/// Reads and decodes a file's metadata record, if present.
pub(crate) fn read_meta(
    shared: &Shared,
    view: &dyn ReadView,
    id: &str,
) -> Result<Option<FileMeta>> {
    let key = keys::file_meta_key(id);
    match view.get(&key)? {
        Some(sealed) => {
            let body = shared.open_value(&key, &sealed)?;
            Ok(Some(serde_json::from_slice(&body)?))
        }
        None => Ok(None),
    }
}

/// Fills `buf` as far as the reader allows; short only at end of
/// input.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::EmptyId);
    }
    Ok(())
}
