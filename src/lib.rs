//! fragstore — an embedded object store
//!
//! Object metadata lives in an embedded key/value database, bulk object
//! data in bucketed fragment files, and a kv-resident write-ahead log makes
//! partial overwrites atomic and crash-replayable.
//!
//! ```no_run
//! use fragstore::{FragStore, Oid, Sequencer, StoreConfig, Transaction};
//!
//! # fn main() -> fragstore::Result<()> {
//! let store = FragStore::new("/var/lib/fragstore", StoreConfig::default())?;
//! store.mkfs()?;
//! store.mount()?;
//!
//! let seq = Sequencer::new();
//! let mut txn = Transaction::new();
//! txn.create_collection("c0")
//!     .touch("c0", Oid::head("greeting"))
//!     .write("c0", Oid::head("greeting"), 0, b"ping".to_vec());
//! store.queue_transactions(&seq, vec![txn])?;
//!
//! let data = store.read(&"c0".into(), &Oid::head("greeting"), 0, 4)?;
//! assert_eq!(data, b"ping");
//! store.umount()?;
//! # Ok(())
//! # }
//! ```

pub use fragstore_core::{
    AllocHint, CollectionId, Error, Fid, FragmentExtent, Oid, OnodeRecord, Result, SnapId,
    StoreConfig,
};
pub use fragstore_engine::{
    Callback, FragStore, Op, Sequencer, Stat, StoreStatfs, Transaction,
    COLL_HINT_EXPECTED_OBJECTS,
};
pub use fragstore_kv::{Batch, KvEngine, MemEngine, Prefix, RedbEngine};
