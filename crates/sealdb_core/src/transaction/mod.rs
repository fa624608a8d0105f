//! The write pipeline.
//!
//! Every mutation in the database - document puts, file chunks, TTL
//! records, index metadata - is packaged as a [`TxnRequest`] and pushed
//! onto one bounded channel. A single coordinator thread drains the
//! channel and commits against the engine, so multi-key requests are
//! atomic and writes from one caller are applied in submission order.

mod coordinator;

pub(crate) use coordinator::spawn_coordinator;

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single mutation inside a request.
#[derive(Debug, Clone)]
pub(crate) struct Operation {
    /// Engine key the operation touches.
    pub key: Vec<u8>,
    /// Sealed value for puts; `None` for deletes.
    pub value: Option<Vec<u8>>,
    /// True for deletes.
    pub delete: bool,
}

impl Operation {
    /// A put of `sealed` under `key`.
    pub(crate) fn put(key: Vec<u8>, sealed: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(sealed),
            delete: false,
        }
    }

    /// A delete of `key`.
    pub(crate) fn delete(key: Vec<u8>) -> Self {
        Self {
            key,
            value: None,
            delete: true,
        }
    }
}

/// A unit of work for the coordinator: a vector of operations applied
/// atomically, plus the channel the outcome is reported on.
pub(crate) struct TxnRequest {
    pub ops: Vec<Operation>,
    pub deadline: Instant,
    pub respond: SyncSender<Result<()>>,
}

impl TxnRequest {
    /// Acknowledges the request; the caller may already be gone, which
    /// is fine.
    pub(crate) fn finish(self, outcome: Result<()>) {
        let _ = self.respond.send(outcome);
    }
}

/// What travels on the write channel.
pub(crate) enum QueueItem {
    /// A caller's request.
    Request(TxnRequest),
    /// Tells the coordinator to stop; sent once by `Database::close`.
    Shutdown,
}

/// Producer side of the write pipeline.
///
/// Cheap to clone; all clones feed the same coordinator. Submission
/// blocks only while the bounded channel is full (backpressure), then
/// waits on a private response channel.
#[derive(Clone)]
pub(crate) struct WriteQueue {
    tx: SyncSender<QueueItem>,
    default_timeout: Duration,
    halted: Arc<AtomicBool>,
}

impl WriteQueue {
    /// Creates the queue and its consumer end.
    pub(crate) fn new(
        depth: usize,
        default_timeout: Duration,
        halted: Arc<AtomicBool>,
    ) -> (Self, Receiver<QueueItem>) {
        let (tx, rx) = mpsc::sync_channel(depth);
        (
            Self {
                tx,
                default_timeout,
                halted,
            },
            rx,
        )
    }

    /// Submits operations with the default deadline and waits for the
    /// commit acknowledgement.
    pub(crate) fn submit(&self, ops: Vec<Operation>) -> Result<()> {
        self.submit_until(ops, Instant::now() + self.default_timeout)
    }

    /// Submits operations with an explicit deadline.
    ///
    /// The deadline bounds both the wait for the acknowledgement and,
    /// on the coordinator side, whether the request is still worth
    /// executing. A request cancelled before its commit started has no
    /// effect; once the commit begins it completes even if the caller
    /// stops waiting.
    pub(crate) fn submit_until(&self, ops: Vec<Operation>, deadline: Instant) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if ops.is_empty() {
            return Ok(());
        }

        let (respond, outcome) = mpsc::sync_channel(1);
        let request = TxnRequest {
            ops,
            deadline,
            respond,
        };
        self.tx
            .send(QueueItem::Request(request))
            .map_err(|_| Error::Closed)?;

        let wait = deadline.saturating_duration_since(Instant::now());
        match outcome.recv_timeout(wait) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    /// Halts the queue and tells the coordinator to stop.
    ///
    /// Submissions racing past the halt flag observe `Closed` once the
    /// coordinator's receiver is gone.
    pub(crate) fn shutdown(&self) {
        self.halted.store(true, Ordering::Release);
        let _ = self.tx.send(QueueItem::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealdb_engine::{KvEngine, MemoryEngine, ReadView};
    use std::sync::Arc;

    fn pipeline(engine: Arc<MemoryEngine>) -> (WriteQueue, std::thread::JoinHandle<()>) {
        let halted = Arc::new(AtomicBool::new(false));
        let (queue, rx) = WriteQueue::new(8, Duration::from_secs(5), Arc::clone(&halted));
        let handle = spawn_coordinator(engine, rx, halted);
        (queue, handle)
    }

    #[test]
    fn multi_operation_request_is_atomic() {
        let engine = Arc::new(MemoryEngine::new());
        let (queue, handle) = pipeline(Arc::clone(&engine));

        queue
            .submit(vec![
                Operation::put(b"a".to_vec(), b"1".to_vec()),
                Operation::put(b"b".to_vec(), b"2".to_vec()),
            ])
            .unwrap();

        let view = engine.view().unwrap();
        assert_eq!(view.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(view.get(b"b").unwrap(), Some(b"2".to_vec()));

        queue.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn expired_request_is_cancelled_without_effect() {
        let engine = Arc::new(MemoryEngine::new());
        let (queue, handle) = pipeline(Arc::clone(&engine));

        let past = Instant::now() - Duration::from_secs(1);
        let err = queue
            .submit_until(vec![Operation::put(b"k".to_vec(), b"v".to_vec())], past)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled | Error::Timeout));

        // A later request flushes the queue; the expired one must have
        // left no trace.
        queue
            .submit(vec![Operation::put(b"probe".to_vec(), b"1".to_vec())])
            .unwrap();
        let view = engine.view().unwrap();
        assert_eq!(view.get(b"k").unwrap(), None);

        queue.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn same_caller_requests_commit_in_order() {
        let engine = Arc::new(MemoryEngine::new());
        let (queue, handle) = pipeline(Arc::clone(&engine));

        for i in 0u8..50 {
            queue
                .submit(vec![Operation::put(b"k".to_vec(), vec![i])])
                .unwrap();
        }
        let view = engine.view().unwrap();
        assert_eq!(view.get(b"k").unwrap(), Some(vec![49]));

        queue.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn failed_commit_reports_engine_failure_and_poisons() {
        let engine = Arc::new(MemoryEngine::new());
        let (queue, handle) = pipeline(Arc::clone(&engine));

        // Sabotage the engine so the next batch commit fails.
        engine.close().unwrap();

        let err = queue
            .submit(vec![Operation::put(b"k".to_vec(), b"v".to_vec())])
            .unwrap_err();
        assert!(matches!(err, Error::EngineFailure { .. }));

        // The failure was fatal, so the pipeline is halted.
        let err = queue
            .submit(vec![Operation::put(b"k".to_vec(), b"v".to_vec())])
            .unwrap_err();
        assert!(matches!(err, Error::Closed));

        drop(queue);
        handle.join().unwrap();
    }

    #[test]
    fn coordinator_exits_when_producers_are_gone() {
        let engine = Arc::new(MemoryEngine::new());
        let (queue, handle) = pipeline(engine);
        drop(queue);
        handle.join().unwrap();
    }

    #[test]
    fn halted_queue_reports_closed() {
        let engine = Arc::new(MemoryEngine::new());
        let (queue, handle) = pipeline(engine);
        queue.shutdown();
        handle.join().unwrap();
        let err = queue
            .submit(vec![Operation::delete(b"k".to_vec())])
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
