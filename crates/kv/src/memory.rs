//! In-memory kv backend for tests
//!
//! A `BTreeMap` behind one mutex. Commit applies the whole batch under the
//! lock, which trivially satisfies the atomicity contract; nothing survives
//! the process, so it is only suitable for engine tests.

use crate::{full_key, Batch, BatchOp, KvEngine, Prefix};
use fragstore_core::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Volatile `BTreeMap` backend
#[derive(Default)]
pub struct MemEngine {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvEngine for MemEngine {
    fn get(&self, prefix: Prefix, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(&full_key(prefix, key)).cloned())
    }

    fn scan(
        &self,
        prefix: Prefix,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let lo = full_key(prefix, start);
        let hi = match end {
            Some(end) => full_key(prefix, end),
            None => vec![prefix.byte() + 1],
        };
        if hi <= lo {
            return Ok(Vec::new());
        }
        let map = self.map.lock();
        Ok(map
            .range((Bound::Included(lo), Bound::Excluded(hi)))
            .map(|(k, v)| (k[1..].to_vec(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        let mut map = self.map.lock();
        for op in batch.into_ops() {
            match op {
                BatchOp::Set { prefix, key, value } => {
                    map.insert(full_key(prefix, &key), value);
                }
                BatchOp::Remove { prefix, key } => {
                    map.remove(&full_key(prefix, &key));
                }
            }
        }
        Ok(())
    }
}
