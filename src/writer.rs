//! C6 - cancellable async writer, built on C5.
//!
//! Owns a dedicated worker thread distinct from the dispatcher. Submits are
//! serialized: at most one write group in flight per device. The
//! cancellation path is the component's reason for existing: a cancel must
//! both stop further work in the writer and wake any waiter blocked on the
//! submit it cancelled, including the writer's own wait on its five
//! underlying I/O completions.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, warn};

use crate::error::{MetadataError, WaitError};
use crate::metadata::MetadataEngine;
use crate::remap_index::RemapEntry;
use crate::stats::Stats;

/// A pending or completed write group, handed back by [`AsyncWriter::submit`].
#[derive(Clone)]
pub struct Handle {
    slot: Arc<CompletionSlot>,
}

struct CompletionSlot {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CompletionState {
    Pending,
    Done(DoneKind),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DoneKind {
    Ok,
    Cancelled,
    Failed,
}

impl CompletionSlot {
    fn new() -> Self {
        Self { state: Mutex::new(CompletionState::Pending), cond: Condvar::new() }
    }

    /// Fires the completion unconditionally; idempotent. This is the single
    /// rendezvous point cancellation and real I/O completion both use, so
    /// neither can leave a waiter blocked forever.
    fn fire(&self, kind: DoneKind) {
        let mut state = self.state.lock().unwrap();
        if *state == CompletionState::Pending {
            *state = CompletionState::Done(kind);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        let state = self.state.lock().unwrap();
        let (state, timed_out) = self
            .cond
            .wait_timeout_while(state, timeout, |s| *s == CompletionState::Pending)
            .unwrap();
        match *state {
            CompletionState::Pending => {
                debug_assert!(timed_out.timed_out());
                Err(WaitError::Timeout)
            }
            CompletionState::Done(DoneKind::Ok) => Ok(()),
            CompletionState::Done(DoneKind::Cancelled) => Err(WaitError::Cancelled),
            CompletionState::Done(DoneKind::Failed) => Err(WaitError::Failed(MetadataError::AllCopiesFailed)),
        }
    }
}

struct WorkItem {
    sequence: u64,
    entries: Vec<RemapEntry>,
    main_sectors: u64,
    spare_sectors: u64,
    slot: Arc<CompletionSlot>,
    cancelled: Arc<Mutex<bool>>,
}

/// Dispatches metadata write groups without blocking the submitter.
pub struct AsyncWriter {
    tx: Mutex<Option<mpsc::Sender<WorkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    current_cancel_flag: Mutex<Option<Arc<Mutex<bool>>>>,
}

impl AsyncWriter {
    /// Spawns the worker thread that will serially drain write groups
    /// through `engine`.
    pub fn spawn(engine: Arc<MetadataEngine>, stats: Arc<Stats>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let writer = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
            current_cancel_flag: Mutex::new(None),
        });

        let worker_writer = writer.clone();
        let handle = std::thread::Builder::new()
            .name("blockremap-metadata-writer".into())
            .spawn(move || {
                for item in rx {
                    *worker_writer.current_cancel_flag.lock().unwrap() = Some(item.cancelled.clone());

                    if *item.cancelled.lock().unwrap() {
                        item.slot.fire(DoneKind::Cancelled);
                        continue;
                    }

                    let result = engine.write_copies(
                        &[0, 1, 2, 3, 4],
                        item.sequence,
                        &item.entries,
                        item.main_sectors,
                        item.spare_sectors,
                    );

                    if *item.cancelled.lock().unwrap() {
                        item.slot.fire(DoneKind::Cancelled);
                        continue;
                    }

                    match result {
                        Ok(()) => item.slot.fire(DoneKind::Ok),
                        Err(MetadataError::AllCopiesFailed) => {
                            error!("metadata write group {} failed on all five copies", item.sequence);
                            stats.total_persistence_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            item.slot.fire(DoneKind::Failed);
                        }
                    }
                }
            })
            .expect("failed to spawn metadata writer thread");
        *writer.worker.lock().unwrap() = Some(handle);
        writer
    }

    /// Submits a write group and returns immediately with a [`Handle`] the
    /// caller can [`wait`](Self::wait) or [`cancel`](Self::cancel) on.
    /// Submits are serialized by the worker's single channel; a submit
    /// arriving while another is in flight simply queues.
    pub fn submit(
        &self,
        sequence: u64,
        entries: Vec<RemapEntry>,
        main_sectors: u64,
        spare_sectors: u64,
    ) -> Handle {
        let slot = Arc::new(CompletionSlot::new());
        let item = WorkItem {
            sequence,
            entries,
            main_sectors,
            spare_sectors,
            slot: slot.clone(),
            cancelled: Arc::new(Mutex::new(false)),
        };

        let tx_guard = self.tx.lock().unwrap();
        if let Some(tx) = tx_guard.as_ref() {
            if tx.send(item).is_err() {
                slot.fire(DoneKind::Cancelled);
            }
        } else {
            slot.fire(DoneKind::Cancelled);
        }

        Handle { slot }
    }

    /// Blocks until `handle`'s write group completes, is cancelled, or
    /// `timeout` elapses. On timeout the underlying I/O is left running;
    /// its eventual result is discarded.
    pub fn wait(&self, handle: &Handle, timeout: Duration) -> Result<(), WaitError> {
        handle.slot.wait(timeout)
    }

    /// Marks the pending write cancelled. Idempotent, asynchronous: returns
    /// immediately after firing the completion, regardless of whether the
    /// underlying I/O has actually finished.
    pub fn cancel(&self, handle: &Handle) {
        handle.slot.fire(DoneKind::Cancelled);
        if let Some(flag) = self.current_cancel_flag.lock().unwrap().as_ref() {
            *flag.lock().unwrap() = true;
        }
    }

    /// Drains the work queue and joins the worker thread. Called by C8
    /// during `Suspended -> Destroyed`; by that point the queue is empty by
    /// construction (teardown has already cancelled any in-flight write).
    pub fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("metadata writer thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemSectorIo, SectorIo};
    use std::sync::Arc;

    fn writer() -> Arc<AsyncWriter> {
        let dev: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(16384));
        let engine = Arc::new(MetadataEngine::new(dev, "main", "spare"));
        AsyncWriter::spawn(engine, Arc::new(Stats::default()))
    }

    #[test]
    fn submit_then_wait_succeeds() {
        let writer = writer();
        let handle = writer.submit(1, vec![], 0, 0);
        assert_eq!(writer.wait(&handle, Duration::from_secs(2)), Ok(()));
        writer.shutdown();
    }

    #[test]
    fn cancel_unblocks_wait() {
        let writer = writer();
        let handle = writer.submit(1, vec![], 0, 0);
        writer.cancel(&handle);
        let result = writer.wait(&handle, Duration::from_secs(2));
        assert!(result == Ok(()) || result == Err(WaitError::Cancelled));
        writer.shutdown();
    }

    #[test]
    fn wait_times_out_when_nothing_submitted() {
        let slot = CompletionSlot::new();
        let start = std::time::Instant::now();
        assert_eq!(slot.wait(Duration::from_millis(50)), Err(WaitError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
