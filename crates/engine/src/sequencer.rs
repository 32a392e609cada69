//! Ordering domains
//!
//! A [`Sequencer`] is the caller-owned ordering handle. On first use the
//! store binds it to an internal [`OpSequencer`], which keeps the FIFO of
//! live transaction contexts. Submissions on one sequencer take its submit
//! lock for the whole pipeline, so commits happen in submission order;
//! distinct sequencers are completely unordered with respect to each other.

use crate::transaction::Callback;
use crate::txc::TransContext;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) struct OpSequencer {
    q: Mutex<VecDeque<Arc<TransContext>>>,
    qcond: Condvar,
    /// Serializes the submit→commit pipeline of this ordering domain.
    pub submit_lock: Mutex<()>,
}

impl OpSequencer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            q: Mutex::new(VecDeque::new()),
            qcond: Condvar::new(),
            submit_lock: Mutex::new(()),
        })
    }

    pub fn queue(&self, txc: Arc<TransContext>) {
        self.q.lock().push_back(txc);
    }

    pub fn dequeue(&self, txc: &Arc<TransContext>) {
        let mut q = self.q.lock();
        let front = q.pop_front();
        debug_assert!(front.map_or(false, |f| Arc::ptr_eq(&f, txc)));
        if q.is_empty() {
            self.qcond.notify_all();
        }
    }

    /// Block until the FIFO drains.
    pub fn flush(&self) {
        let mut q = self.q.lock();
        while !q.is_empty() {
            self.qcond.wait(&mut q);
        }
    }

    /// Register `cb` on the last queued transaction; with an empty FIFO the
    /// callback runs immediately. Returns true when it ran inline.
    pub fn flush_commit(&self, cb: Callback) -> bool {
        let leftover = {
            let q = self.q.lock();
            match q.back() {
                None => Some(cb),
                // the attach can race the commit; a context that already
                // committed hands the callback straight back
                Some(last) => last.add_on_commit(cb),
            }
        };
        match leftover {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }
}

/// Caller-owned ordering handle.
///
/// Transactions submitted through the same sequencer commit and become
/// visible in submission order. The store retains the bound internal
/// sequencer until unmount, so the handle may be dropped at any time.
#[derive(Default)]
pub struct Sequencer {
    inner: OnceCell<Arc<OpSequencer>>,
}

impl Sequencer {
    /// Create an unbound sequencer; the store binds it on first submission.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind_with(&self, make: impl FnOnce() -> Arc<OpSequencer>) -> Arc<OpSequencer> {
        Arc::clone(self.inner.get_or_init(make))
    }

    /// Wait until every transaction submitted on this sequencer committed.
    pub fn flush(&self) {
        if let Some(osr) = self.inner.get() {
            osr.flush();
        }
    }

    /// Run `cb` once everything currently queued has committed; with nothing
    /// in flight it runs inline. Returns true when it ran inline.
    pub fn flush_commit(&self, cb: Callback) -> bool {
        match self.inner.get() {
            Some(osr) => osr.flush_commit(cb),
            None => {
                cb();
                true
            }
        }
    }
}
