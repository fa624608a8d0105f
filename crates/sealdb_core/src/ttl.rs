//! Time-ordered deletion schedule.
//!
//! TTL records are keyed by their scheduled firing time, so scanning
//! the TTL prefix in ascending byte order visits them in firing order.
//! A background worker sleeps until the earliest record is due and then
//! deletes, per record, the targeted keys and the record itself in one
//! transaction.

use crate::database::Shared;
use crate::error::Result;
use crate::file;
use crate::keys;
use crate::transaction::Operation;
use rand::RngCore;
use sealdb_engine::ReadView;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// How long the worker sleeps when the schedule is empty.
const TTL_IDLE: Duration = Duration::from_secs(60);

/// Due records processed per wake-up scan page.
const TTL_PAGE: usize = 32;

/// Wake-up signal for the TTL worker.
pub(crate) enum TtlSignal {
    /// A new record was scheduled; recompute the wake-up time.
    Recheck,
}

/// Sealed descriptor stored as a TTL record's value.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TtlTarget {
    /// Collection of the expiring document; `None` for files.
    pub collection: Option<String>,
    /// Id of the expiring document or file.
    pub id: String,
    /// True when the target is a file.
    pub is_file: bool,
}

/// Builds the put operation scheduling `target` for deletion after
/// `ttl`.
///
/// The record's scheduled time is always at or after its creation time.
pub(crate) fn schedule_op(shared: &Shared, target: &TtlTarget, ttl: Duration) -> Result<Operation> {
    let when = SystemTime::now() + ttl;
    let nanos = unix_nanos(when);
    let mut entropy = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut entropy);

    let key = keys::ttl_key(nanos, entropy);
    let sealed = shared.seal(&key, &serde_json::to_vec(target)?)?;
    Ok(Operation::put(key, sealed))
}

/// Spawns the background worker draining the schedule.
pub(crate) fn spawn_ttl_worker(shared: Arc<Shared>, rx: Receiver<TtlSignal>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("sealdb-ttl".into())
        .spawn(move || run(&shared, &rx))
        .expect("failed to spawn TTL worker thread")
}

fn run(shared: &Shared, rx: &Receiver<TtlSignal>) {
    loop {
        let wait = match next_due(shared) {
            Ok(Some(when)) => {
                let now = unix_nanos(SystemTime::now());
                if when <= now {
                    if let Err(err) = fire_due(shared) {
                        warn!(%err, "TTL sweep failed");
                    }
                    continue;
                }
                Duration::from_nanos(when - now).min(TTL_IDLE)
            }
            Ok(None) => TTL_IDLE,
            Err(err) => {
                warn!(%err, "TTL schedule scan failed");
                TTL_IDLE
            }
        };

        match rx.recv_timeout(wait) {
            Ok(TtlSignal::Recheck) => continue,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("TTL worker shutting down");
}

/// Scheduled time of the earliest record, if any.
fn next_due(shared: &Shared) -> Result<Option<u64>> {
    let view = shared.view()?;
    let scope = keys::ttl_scope();
    let page = view.scan_keys(&scope, &scope, 1)?;
    Ok(page.keys.first().and_then(|key| keys::ttl_key_time(key)))
}

/// Deletes every due record together with its target keys; records
/// fire strictly in scheduled order, ties broken by the entropy
/// suffix.
fn fire_due(shared: &Shared) -> Result<()> {
    let now = unix_nanos(SystemTime::now());
    let view = shared.view()?;
    let scope = keys::ttl_scope();
    let mut from = scope.clone();

    loop {
        let page = view.scan(&from, &scope, TTL_PAGE)?;
        let mut saw_future = false;
        for (key, sealed) in &page.entries {
            match keys::ttl_key_time(key) {
                Some(when) if when <= now => {}
                _ => {
                    saw_future = true;
                    break;
                }
            }

            let target: TtlTarget =
                serde_json::from_slice(&shared.open_value(key, sealed)?)?;
            let mut ops = target_delete_ops(shared, view.as_ref(), &target)?;
            ops.push(Operation::delete(key.clone()));
            // Targets and the record itself go in one transaction.
            shared.queue.submit(ops)?;
            debug!(id = %target.id, is_file = target.is_file, "TTL fired");
        }

        match page.entries.last() {
            Some(last) if page.more && !saw_future => {
                from = sealdb_engine::next_key(&last.0);
            }
            _ => break,
        }
    }
    Ok(())
}

/// Delete operations for the keys a TTL record targets.
fn target_delete_ops(
    shared: &Shared,
    view: &dyn ReadView,
    target: &TtlTarget,
) -> Result<Vec<Operation>> {
    if target.is_file {
        return file::delete_file_ops(view, &target.id);
    }

    let mut ops = Vec::new();
    if let Some(collection) = &target.collection {
        if let Some(prefix) = shared.collections.read().get(collection).copied() {
            ops.push(Operation::delete(keys::document_key(prefix, &target.id)));

            // Version records expire with the document.
            let history = keys::history_prefix(prefix, &target.id);
            let mut from = history.clone();
            loop {
                let page = view.scan_keys(&from, &history, TTL_PAGE)?;
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
        }
    }
    Ok(ops)
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}
