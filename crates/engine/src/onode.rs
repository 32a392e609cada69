//! In-memory object records
//!
//! An [`Onode`] is shared between the cache (weakly), every in-flight
//! transaction context that staged work against it (strongly), and the wal
//! apply worker. Mutable state sits behind the onode's own mutex; the
//! condvar lets readers wait out committed-but-unapplied wal transactions.

use fragstore_core::{Oid, OnodeRecord};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

pub(crate) struct OnodeState {
    /// Metadata as it will be persisted
    pub record: OnodeRecord,
    /// Tombstone: false after REMOVE until a later transaction re-creates it
    pub exists: bool,
    /// In-memory mutation not yet staged to kv
    pub dirty: bool,
    /// Committed wal transactions not yet replayed to the fragment files.
    /// The apply worker is a single FIFO thread, so a count is sufficient to
    /// track the queue the wal entries form.
    pub unapplied_txns: u32,
}

pub(crate) struct Onode {
    /// Immutable identifier
    pub oid: Oid,
    /// Cached kv row key (collection scoped)
    pub key: Vec<u8>,
    state: Mutex<OnodeState>,
    wal_cond: Condvar,
}

impl Onode {
    pub fn new(oid: Oid, key: Vec<u8>, record: OnodeRecord, exists: bool, dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            oid,
            key,
            state: Mutex::new(OnodeState {
                record,
                exists,
                dirty,
                unapplied_txns: 0,
            }),
            wal_cond: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, OnodeState> {
        self.state.lock()
    }

    /// Called at commit for each wal-bearing transaction touching this onode.
    pub fn begin_wal_apply(&self) {
        self.state.lock().unapplied_txns += 1;
    }

    /// Called by the apply worker once the wal transaction reached the
    /// fragment files; wakes readers waiting for a consistent view.
    pub fn finish_wal_apply(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.unapplied_txns > 0);
        state.unapplied_txns = state.unapplied_txns.saturating_sub(1);
        if state.unapplied_txns == 0 {
            self.wal_cond.notify_all();
        }
    }

    /// Block until every committed wal transaction has been applied.
    pub fn wait_unapplied(&self) {
        let mut state = self.state.lock();
        while state.unapplied_txns > 0 {
            self.wal_cond.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragstore_core::Oid;
    use std::time::Duration;

    fn mk() -> Arc<Onode> {
        let oid = Oid::head("o");
        Onode::new(oid, b"key".to_vec(), OnodeRecord::default(), true, false)
    }

    #[test]
    fn test_wait_with_nothing_pending_returns() {
        mk().wait_unapplied();
    }

    #[test]
    fn test_wait_blocks_until_applied() {
        let o = mk();
        o.begin_wal_apply();
        o.begin_wal_apply();

        let o2 = Arc::clone(&o);
        let waiter = std::thread::spawn(move || {
            o2.wait_unapplied();
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        o.finish_wal_apply();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        o.finish_wal_apply();
        waiter.join().unwrap();
    }
}
