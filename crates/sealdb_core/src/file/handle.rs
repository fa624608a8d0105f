//! Random-access file handles.
//!
//! A handle owns a snapshot read view, a one-chunk decrypt cache and a
//! dead-man timer. Handles are scoped resources: close is idempotent,
//! drop closes, and a background reaper force-closes handles that were
//! left unused past the configured timeout (clearing `in_write` for
//! writers).

use crate::database::Shared;
use crate::error::{Error, Result};
use crate::file::{read_meta, FileMeta};
use crate::keys;
use crate::transaction::Operation;
use parking_lot::Mutex;
use sealdb_engine::ReadView;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// How long the reaper sleeps when no handle is open.
const REAPER_IDLE: Duration = Duration::from_secs(10);

/// Liveness state of one handle, shared with the reaper.
pub(crate) struct HandleState {
    file_id: String,
    writer: bool,
    expires_at: Mutex<Instant>,
    closed: AtomicBool,
}

impl HandleState {
    fn touch(&self, timeout: Duration) {
        *self.expires_at.lock() = Instant::now() + timeout;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Wake-up signal for the reaper thread.
pub(crate) enum ReaperSignal {
    /// A handle was opened; recompute the next deadline.
    Recheck,
}

/// Registry of open handles, swept by the reaper thread.
pub(crate) struct HandleRegistry {
    handles: Mutex<Vec<Arc<HandleState>>>,
    notify: Mutex<Option<Sender<ReaperSignal>>>,
}

impl HandleRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            notify: Mutex::new(None),
        }
    }

    fn register(&self, state: Arc<HandleState>) {
        self.handles.lock().push(state);
        if let Some(tx) = self.notify.lock().as_ref() {
            let _ = tx.send(ReaperSignal::Recheck);
        }
    }

    /// Stops the reaper; called once by `Database::close`.
    pub(crate) fn shutdown(&self) {
        drop(self.notify.lock().take());
    }
}

/// Spawns the thread that force-closes idle handles.
pub(crate) fn spawn_reaper(shared: Arc<Shared>) -> JoinHandle<()> {
    let (tx, rx) = mpsc::channel();
    *shared.handles.notify.lock() = Some(tx);
    std::thread::Builder::new()
        .name("sealdb-handle-reaper".into())
        .spawn(move || run_reaper(&shared, &rx))
        .expect("failed to spawn reaper thread")
}

fn run_reaper(shared: &Shared, rx: &Receiver<ReaperSignal>) {
    loop {
        let next_deadline = {
            let mut handles = shared.handles.handles.lock();
            handles.retain(|state| !state.is_closed());
            handles.iter().map(|state| *state.expires_at.lock()).min()
        };

        let wait = next_deadline.map_or(REAPER_IDLE, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });

        match rx.recv_timeout(wait) {
            Ok(ReaperSignal::Recheck) => continue,
            Err(RecvTimeoutError::Timeout) => reap_expired(shared),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("handle reaper shutting down");
}

fn reap_expired(shared: &Shared) {
    let now = Instant::now();
    let expired: Vec<Arc<HandleState>> = {
        let handles = shared.handles.handles.lock();
        handles
            .iter()
            .filter(|state| !state.is_closed() && *state.expires_at.lock() <= now)
            .cloned()
            .collect()
    };

    for state in expired {
        if state.closed.swap(true, Ordering::AcqRel) {
            continue;
        }
        warn!(file = %state.file_id, writer = state.writer, "force-closing idle file handle");
        if state.writer {
            if let Err(err) = clear_in_write(shared, &state.file_id) {
                warn!(file = %state.file_id, %err, "failed to release in_write on reap");
            }
        }
    }
}

/// Rewrites the file's metadata with `in_write` cleared.
fn clear_in_write(shared: &Shared, id: &str) -> Result<()> {
    let view = shared.view()?;
    let Some(mut meta) = read_meta(shared, view.as_ref(), id)? else {
        return Ok(());
    };
    if !meta.in_write {
        return Ok(());
    }
    meta.in_write = false;
    let key = keys::file_meta_key(id);
    let sealed = shared.seal(&key, &serde_json::to_vec(&meta)?)?;
    shared.queue.submit(vec![Operation::put(key, sealed)])
}

/// Opens a reader positioned at the start of the file.
pub(crate) fn open_reader(shared: Arc<Shared>, id: &str) -> Result<FileReader> {
    let view = shared.view()?;
    let meta = read_meta(&shared, view.as_ref(), id)?.ok_or(Error::NotFound)?;
    let inner = ReadWriter::open(shared, meta, view, false)?;
    Ok(FileReader { inner })
}

/// Opens a writer positioned at the end of the file, creating the
/// metadata record if the file is new.
pub(crate) fn open_writer(
    shared: Arc<Shared>,
    id: &str,
    name: &str,
    related: Option<(&str, &str)>,
) -> Result<FileWriter> {
    let view = shared.view()?;
    let mut meta = match read_meta(&shared, view.as_ref(), id)? {
        Some(meta) => meta,
        None => FileMeta::new(id, name, shared.config.chunk_size),
    };
    if meta.in_write {
        return Err(Error::FileInWrite);
    }

    if let Some((collection, document_id)) = related {
        let prefix = shared.collection_prefix_for(collection)?;
        meta.related_collection = Some(collection.to_string());
        meta.related_document_id = Some(document_id.to_string());
        super::add_related_file_id(&shared, prefix, document_id, id)?;
    }

    meta.in_write = true;
    put_meta(&shared, &meta)?;

    // A fresh view so the handle sees its own metadata write.
    let view = shared.view()?;
    let mut inner = ReadWriter::open(shared, meta, view, true)?;
    inner.position = inner.meta.size;
    Ok(FileWriter { inner })
}

fn put_meta(shared: &Shared, meta: &FileMeta) -> Result<()> {
    let key = keys::file_meta_key(&meta.id);
    let sealed = shared.seal(&key, &serde_json::to_vec(meta)?)?;
    shared.queue.submit(vec![Operation::put(key, sealed)])
}

/// The state common to readers and writers.
struct ReadWriter {
    shared: Arc<Shared>,
    meta: FileMeta,
    view: Box<dyn ReadView>,
    /// Most recently decrypted chunk; invalidated on every write.
    cache: Option<(u64, Vec<u8>)>,
    position: u64,
    state: Arc<HandleState>,
}

impl ReadWriter {
    fn open(
        shared: Arc<Shared>,
        meta: FileMeta,
        view: Box<dyn ReadView>,
        writer: bool,
    ) -> Result<Self> {
        let state = Arc::new(HandleState {
            file_id: meta.id.clone(),
            writer,
            expires_at: Mutex::new(Instant::now() + shared.config.reader_writer_timeout),
            closed: AtomicBool::new(false),
        });
        shared.handles.register(Arc::clone(&state));
        Ok(Self {
            shared,
            meta,
            view,
            cache: None,
            position: 0,
            state,
        })
    }

    /// Rejects operations on closed handles and re-arms the dead-man
    /// timer.
    fn guard(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::Closed);
        }
        self.shared.check_open()?;
        self.state.touch(self.shared.config.reader_writer_timeout);
        Ok(())
    }

    fn block_of(&self, position: u64) -> (u64, usize) {
        let chunk_size = self.meta.chunk_size as u64;
        (position / chunk_size + 1, (position % chunk_size) as usize)
    }

    /// Loads (and caches) the decrypted content of chunk `block`; a
    /// missing chunk is empty.
    fn ensure_cached(&mut self, block: u64) -> Result<()> {
        if self.cache.as_ref().is_some_and(|(cached, _)| *cached == block) {
            return Ok(());
        }
        let data = self.fetch_chunk(block)?;
        self.cache = Some((block, data));
        Ok(())
    }

    fn fetch_chunk(&self, block: u64) -> Result<Vec<u8>> {
        let key = keys::file_chunk_key(&self.meta.id, block);
        match self.view.get(&key)? {
            Some(sealed) => self.shared.open_value(&key, &sealed),
            None => Ok(Vec::new()),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.guard()?;
        let mut produced = 0;
        while produced < buf.len() && self.position < self.meta.size {
            let (block, inside) = self.block_of(self.position);
            self.ensure_cached(block)?;
            let chunk = &self.cache.as_ref().expect("chunk cached above").1;
            if inside >= chunk.len() {
                break;
            }
            let take = (buf.len() - produced).min(chunk.len() - inside);
            buf[produced..produced + take].copy_from_slice(&chunk[inside..inside + take]);
            produced += take;
            self.position += take as u64;
        }
        Ok(produced)
    }

    /// Splices `data` into the file at the current position.
    fn write_some(&mut self, data: &[u8]) -> Result<usize> {
        self.guard()?;
        let chunk_size = self.meta.chunk_size;
        let start = self.position;

        let mut written = 0;
        let (mut block, first_inside) = self.block_of(start);
        let mut inside = first_inside;
        while written < data.len() {
            let space = chunk_size - inside;
            let take = space.min(data.len() - written);
            let piece = &data[written..written + take];

            let content = if take == chunk_size {
                // Full overwrite: no need to read what was there.
                piece.to_vec()
            } else {
                // Partial chunk: keep the head before the write and
                // whatever tail survives beyond it.
                let old = self.fetch_chunk(block)?;
                let mut merged = Vec::with_capacity(chunk_size);
                merged.extend_from_slice(&old[..inside.min(old.len())]);
                merged.extend_from_slice(piece);
                let tail_start = inside + take;
                if tail_start < old.len() {
                    merged.extend_from_slice(&old[tail_start..]);
                }
                merged
            };

            let key = keys::file_chunk_key(&self.meta.id, block);
            let sealed = self.shared.seal(&key, &content)?;
            self.shared.queue.submit(vec![Operation::put(key, sealed)])?;

            written += take;
            block += 1;
            inside = 0;
        }

        self.after_write(start, written as u64)?;
        Ok(written)
    }

    /// Post-write bookkeeping: fresh snapshot, cache invalidation,
    /// metadata update.
    fn after_write(&mut self, start: u64, written: u64) -> Result<()> {
        self.view = self.shared.view()?;
        self.cache = None;
        self.meta.size = self.meta.size.max(start + written);
        self.meta.last_modified = SystemTime::now();
        self.position = start + written;
        put_meta(&self.shared, &self.meta)
    }

    fn seek_to(&mut self, pos: io::SeekFrom) -> Result<u64> {
        self.guard()?;
        let size = i128::from(self.meta.size);
        let target: i128 = match pos {
            io::SeekFrom::Start(offset) => i128::from(offset),
            io::SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            // The offset is subtracted from the size, not added. This
            // matches the store's historical on-disk behavior.
            io::SeekFrom::End(offset) => size - i128::from(offset),
        };
        if target < 0 || target > size {
            return Err(Error::OutOfFile {
                position: target as i64,
                size: self.meta.size as i64,
            });
        }
        self.position = target as u64;
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.state.writer {
            self.meta.in_write = false;
            put_meta(&self.shared, &self.meta)?;
        }
        Ok(())
    }
}

impl Drop for ReadWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn to_io(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Random-access reader over a stored file.
///
/// Implements [`std::io::Read`] and [`std::io::Seek`]; `read_at`
/// provides positioned reads. The handle holds a stable snapshot of
/// the file and auto-closes after the configured inactivity timeout.
pub struct FileReader {
    inner: ReadWriter,
}

impl FileReader {
    /// The file's metadata as seen by this handle.
    #[must_use]
    pub fn meta(&self) -> &FileMeta {
        &self.inner.meta
    }

    /// Reads up to `buf.len()` bytes starting at absolute `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndOfFile`] when `offset` is at or past the end
    /// of the file.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.inner.meta.size {
            return Err(Error::EndOfFile);
        }
        self.inner.position = offset;
        self.inner.read_some(buf)
    }

    /// Closes the handle. Idempotent; also performed on drop and by
    /// the inactivity timer.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl io::Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_some(buf).map_err(to_io)
    }
}

impl io::Seek for FileReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.inner.seek_to(pos).map_err(to_io)
    }
}

/// Random-access writer over a stored file.
///
/// Opens positioned at the end of the file with `in_write` set; only
/// one writer may own a file at a time. Also readable and seekable.
pub struct FileWriter {
    inner: ReadWriter,
}

impl FileWriter {
    /// The file's metadata as seen by this handle.
    #[must_use]
    pub fn meta(&self) -> &FileMeta {
        &self.inner.meta
    }

    /// Reads up to `buf.len()` bytes starting at absolute `offset`.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.inner.meta.size {
            return Err(Error::EndOfFile);
        }
        self.inner.position = offset;
        self.inner.read_some(buf)
    }

    /// Writes `data` starting at absolute `offset`, splicing into
    /// existing chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfFile`] when `offset` is at or past the end
    /// of the file; appends go through [`std::io::Write::write`] at the
    /// end position instead.
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if offset >= self.inner.meta.size {
            return Err(Error::OutOfFile {
                position: offset as i64,
                size: self.inner.meta.size as i64,
            });
        }
        self.inner.position = offset;
        self.inner.write_some(data)
    }

    /// Closes the handle and clears `in_write`. Idempotent; also
    /// performed on drop and by the inactivity timer.
    pub fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl io::Read for FileWriter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_some(buf).map_err(to_io)
    }
}

impl io::Write for FileWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.inner.write_some(data).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Every write is acknowledged by the coordinator before
        // returning; there is nothing buffered to flush.
        Ok(())
    }
}

impl io::Seek for FileWriter {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.inner.seek_to(pos).map_err(to_io)
    }
}
