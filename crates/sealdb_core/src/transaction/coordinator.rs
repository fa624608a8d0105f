//! The coordinator thread.

use crate::error::Error;
use crate::transaction::{QueueItem, TxnRequest};
use sealdb_engine::{EngineError, KvEngine, WriteBatch};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Adjacent requests are coalesced into one engine transaction until the
/// combined operation count reaches this threshold.
const MAX_BATCH_OPS: usize = 128;

/// Spawns the dedicated coordinator thread.
///
/// The thread drains `rx` in FIFO order and exits on the shutdown item
/// or when every producer handle has been dropped. It owns all commits:
/// no other code path may call [`KvEngine::apply`] while the coordinator
/// runs.
pub(crate) fn spawn_coordinator(
    engine: Arc<dyn KvEngine>,
    rx: Receiver<QueueItem>,
    poisoned: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("sealdb-coordinator".into())
        .spawn(move || run(engine.as_ref(), &rx, &poisoned))
        .expect("failed to spawn coordinator thread")
}

fn run(engine: &dyn KvEngine, rx: &Receiver<QueueItem>, poisoned: &AtomicBool) {
    while let Ok(item) = rx.recv() {
        let first = match item {
            QueueItem::Request(request) => request,
            QueueItem::Shutdown => break,
        };
        let mut requests = vec![first];
        let mut op_count = requests[0].ops.len();
        let mut stop_after_batch = false;

        // Coalesce whatever is already queued, up to the threshold.
        while op_count < MAX_BATCH_OPS {
            match rx.try_recv() {
                Ok(QueueItem::Request(request)) => {
                    op_count += request.ops.len();
                    requests.push(request);
                }
                Ok(QueueItem::Shutdown) => {
                    stop_after_batch = true;
                    break;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        commit_batch(engine, requests, poisoned);
        if stop_after_batch {
            break;
        }
    }
    debug!("coordinator shutting down");
}

fn commit_batch(engine: &dyn KvEngine, requests: Vec<TxnRequest>, poisoned: &AtomicBool) {
    let now = Instant::now();
    let mut live = Vec::with_capacity(requests.len());
    for request in requests {
        if request.deadline <= now {
            // Cancelled before its commit started: skip, no effect.
            debug!(ops = request.ops.len(), "dropping expired write request");
            request.finish(Err(Error::Cancelled));
        } else {
            live.push(request);
        }
    }
    if live.is_empty() {
        return;
    }

    let mut batch = WriteBatch::with_capacity(live.iter().map(|r| r.ops.len()).sum());
    for request in &live {
        for op in &request.ops {
            if op.delete {
                batch.delete(op.key.clone());
            } else if let Some(value) = &op.value {
                batch.put(op.key.clone(), value.clone());
            }
        }
    }

    match engine.apply(batch) {
        Ok(()) => {
            for request in live {
                request.finish(Ok(()));
            }
        }
        Err(err) => {
            warn!(%err, requests = live.len(), "engine batch commit failed");
            if is_fatal(&err) {
                error!(%err, "fatal engine failure, poisoning database");
                poisoned.store(true, Ordering::Release);
            }
            // Every member of the failed batch observes the same error;
            // the coordinator moves on to the next batch.
            for request in live {
                request.finish(Err(Error::engine_failure(&err)));
            }
        }
    }
}

/// Whether an engine error leaves the store unusable.
fn is_fatal(err: &EngineError) -> bool {
    matches!(err, EngineError::Closed | EngineError::Io(_) | EngineError::Corrupted { .. })
}
