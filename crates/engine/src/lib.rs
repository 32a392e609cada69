//! The fragstore object store engine
//!
//! Object metadata (onodes) lives in an embedded kv store; bulk object data
//! lives in bucketed fragment files on the host filesystem. A kv-resident
//! write-ahead log carries partial data overwrites so that every transaction
//! is atomic and replayable after a crash.
//!
//! Entry point is [`FragStore`]: format with [`FragStore::mkfs`], attach
//! with [`FragStore::mount`], submit batched transactions with
//! [`FragStore::queue_transactions`], and read back through the read
//! surface (`read`, `stat`, attrs, omap, collection listing).

mod cache;
mod finisher;
mod fragments;
mod onode;
mod paths;
mod sequencer;
mod store;
mod transaction;
mod txc;
mod wal;

pub use sequencer::Sequencer;
pub use store::{FragStore, Stat, StoreStatfs};
pub use transaction::{Callback, Op, Transaction, COLL_HINT_EXPECTED_OBJECTS};
