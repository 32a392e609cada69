//! Transaction context
//!
//! Transient container holding everything one submission staged: dirty
//! onodes to flush, fragment fds awaiting fsync, fids to unlink after
//! commit, the pending kv batch, the optional wal transaction, and the
//! completion callbacks. Owned by one submission, but shared with the
//! sequencer FIFO (for `flush_commit`) and the wal apply worker.

use crate::onode::Onode;
use crate::sequencer::OpSequencer;
use crate::transaction::Callback;
use crate::wal::{WalOp, WalTransaction};
use fragstore_core::Fid;
use fragstore_kv::Batch;
use parking_lot::Mutex;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CommitCallbacks {
    committed: bool,
    callbacks: Vec<Callback>,
}

pub(crate) struct TransContext {
    pub osr: Arc<OpSequencer>,
    /// Dirty onodes to flush to kv, in first-touch order, deduplicated
    onodes: Mutex<Vec<Arc<Onode>>>,
    /// Freshly written fragment fds requiring fsync before the kv commit
    fds_to_sync: Mutex<Vec<File>>,
    /// Fragment files to unlink once the kv commit succeeded
    fids_to_remove: Mutex<Vec<Fid>>,
    /// Pending kv mutations
    batch: Mutex<Batch>,
    /// Deferred data mutations, if any op produced them
    wal_txn: Mutex<Option<WalTransaction>>,
    /// Whether this context allocated fids (drives the watermark update)
    allocated_fids: Mutex<bool>,
    on_commit: Mutex<CommitCallbacks>,
}

impl TransContext {
    pub fn new(osr: Arc<OpSequencer>) -> Self {
        Self {
            osr,
            onodes: Mutex::new(Vec::new()),
            fds_to_sync: Mutex::new(Vec::new()),
            fids_to_remove: Mutex::new(Vec::new()),
            batch: Mutex::new(Batch::new()),
            wal_txn: Mutex::new(None),
            allocated_fids: Mutex::new(false),
            on_commit: Mutex::new(CommitCallbacks::default()),
        }
    }

    pub fn write_onode(&self, onode: &Arc<Onode>) {
        let mut onodes = self.onodes.lock();
        if !onodes.iter().any(|o| Arc::ptr_eq(o, onode)) {
            onodes.push(Arc::clone(onode));
        }
    }

    pub fn onodes(&self) -> Vec<Arc<Onode>> {
        self.onodes.lock().clone()
    }

    pub fn sync_fd(&self, file: File) {
        self.fds_to_sync.lock().push(file);
    }

    pub fn take_fds_to_sync(&self) -> Vec<File> {
        std::mem::take(&mut *self.fds_to_sync.lock())
    }

    pub fn remove_fid(&self, fid: Fid) {
        self.fids_to_remove.lock().push(fid);
    }

    pub fn take_fids_to_remove(&self) -> Vec<Fid> {
        std::mem::take(&mut *self.fids_to_remove.lock())
    }

    pub fn note_allocated_fid(&self) {
        *self.allocated_fids.lock() = true;
    }

    pub fn allocated_fids(&self) -> bool {
        *self.allocated_fids.lock()
    }

    pub fn batch(&self) -> parking_lot::MutexGuard<'_, Batch> {
        self.batch.lock()
    }

    pub fn take_batch(&self) -> Batch {
        std::mem::take(&mut *self.batch.lock())
    }

    /// Append wal ops, opening the context's wal transaction on first use
    /// with a sequence drawn from `seq_counter`.
    pub fn push_wal_ops(&self, seq_counter: &AtomicU64, ops: impl IntoIterator<Item = WalOp>) {
        let mut wal = self.wal_txn.lock();
        let txn = wal.get_or_insert_with(|| {
            WalTransaction::new(seq_counter.fetch_add(1, Ordering::SeqCst) + 1)
        });
        txn.ops.extend(ops);
    }

    pub fn wal_txn(&self) -> Option<WalTransaction> {
        self.wal_txn.lock().clone()
    }

    /// Attach a commit callback. Returns the callback back when the context
    /// already committed, in which case the caller runs it inline.
    pub fn add_on_commit(&self, cb: Callback) -> Option<Callback> {
        let mut state = self.on_commit.lock();
        if state.committed {
            Some(cb)
        } else {
            state.callbacks.push(cb);
            None
        }
    }

    /// Mark the context committed and drain the callbacks registered so far.
    pub fn mark_committed(&self) -> Vec<Callback> {
        let mut state = self.on_commit.lock();
        state.committed = true;
        std::mem::take(&mut state.callbacks)
    }

    /// Bump the unapplied-wal counter on every staged onode. Runs after the
    /// kv commit, before the context is handed to the apply worker.
    pub fn start_wal_apply(&self) {
        for onode in self.onodes.lock().iter() {
            onode.begin_wal_apply();
        }
    }

    /// Drop the unapplied-wal counters once the apply worker finished,
    /// waking readers.
    pub fn finish_wal_apply(&self) {
        for onode in self.onodes.lock().iter() {
            onode.finish_wal_apply();
        }
    }
}
