//! Key/value adapter for the object store
//!
//! The engine talks to the metadata database through the narrow [`KvEngine`]
//! trait: point get, half-open range scan, and atomic batch commit. Keys are
//! namespaced by a single-byte [`Prefix`]; the adapter composes the full row
//! key and strips the prefix again on the way out.
//!
//! Two backends are provided:
//! - [`RedbEngine`]: durable, one redb write transaction per batch
//! - [`MemEngine`]: `BTreeMap` behind a mutex, for tests
//!
//! Batches preserve mutation order, so a `set` followed by a `remove` of the
//! same key leaves the key absent.

mod memory;
mod redb_backend;

pub use memory::MemEngine;
pub use redb_backend::RedbEngine;

use fragstore_core::{Error, Result};
use std::path::Path;
use std::sync::Arc;

/// Key-space prefixes used by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
    /// Collection presence rows (`C`)
    Coll,
    /// Object rows: encoded oid key -> encoded onode (`O`)
    Obj,
    /// Write-ahead log rows: sequence -> encoded wal transaction (`L`)
    Wal,
    /// Object-map rows: oid key [+ user key] -> bytes (`M`)
    Omap,
    /// Superblock row (`S`)
    Super,
}

impl Prefix {
    /// The byte prepended to every row key in this space.
    pub fn byte(self) -> u8 {
        match self {
            Prefix::Coll => b'C',
            Prefix::Obj => b'O',
            Prefix::Wal => b'L',
            Prefix::Omap => b'M',
            Prefix::Super => b'S',
        }
    }
}

pub(crate) fn full_key(prefix: Prefix, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(prefix.byte());
    out.extend_from_slice(key);
    out
}

/// One staged mutation
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or overwrite a row
    Set {
        /// Key space
        prefix: Prefix,
        /// Row key (without prefix byte)
        key: Vec<u8>,
        /// Row value
        value: Vec<u8>,
    },
    /// Delete a row (absent rows are fine)
    Remove {
        /// Key space
        prefix: Prefix,
        /// Row key (without prefix byte)
        key: Vec<u8>,
    },
}

/// An ordered set of mutations committed atomically
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an insert/overwrite
    pub fn set(&mut self, prefix: Prefix, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Set {
            prefix,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Stage a deletion
    pub fn remove(&mut self, prefix: Prefix, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Remove {
            prefix,
            key: key.into(),
        });
    }

    /// Number of staged mutations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch has no mutations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch, yielding mutations in staging order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// The embedded key/value engine the store is built on.
///
/// `commit` is atomic and durable: either every mutation in the batch is
/// visible on return, or none. Mutations are applied in staging order.
pub trait KvEngine: Send + Sync {
    /// Point lookup. `None` means the key is absent.
    fn get(&self, prefix: Prefix, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Scan `[start, end)` within one prefix space, in key order.
    ///
    /// `end = None` scans to the end of the prefix space. Returned keys have
    /// the prefix byte stripped.
    fn scan(&self, prefix: Prefix, start: &[u8], end: Option<&[u8]>)
        -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically and durably apply a batch.
    fn commit(&self, batch: Batch) -> Result<()>;
}

/// Open a kv backend by configured name.
///
/// `dir` is the store's `db/` directory; the backend keeps its private tree
/// underneath it.
pub fn open_backend(name: &str, dir: &Path) -> Result<Arc<dyn KvEngine>> {
    match name {
        "redb" => Ok(Arc::new(RedbEngine::open(&dir.join("kv.redb"))?)),
        "memory" => Ok(Arc::new(MemEngine::new())),
        other => Err(Error::Unsupported(format!("kv backend {:?}", other))),
    }
}
