//! Per-collection onode cache
//!
//! A weak-value map from oid to in-memory onode. Lookups that hit a live
//! reference return it; misses load the record from the kv store under the
//! object prefix. Concurrent lookups for the same missing entry coalesce
//! through an inflight marker so exactly one kv load happens.
//!
//! The cache never persists anything; flushing dirty onodes is the
//! transaction engine's job.

use crate::onode::Onode;
use fragstore_core::{keys, CollectionId, Oid, OnodeRecord, Result};
use fragstore_kv::{KvEngine, Prefix};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct LoadState {
    result: Mutex<Option<Option<Arc<Onode>>>>,
    cond: Condvar,
}

impl LoadState {
    fn publish(&self, value: Option<Arc<Onode>>) {
        *self.result.lock() = Some(value);
        self.cond.notify_all();
    }

    fn wait(&self) -> Option<Arc<Onode>> {
        let mut result = self.result.lock();
        loop {
            if let Some(value) = result.as_ref() {
                return value.clone();
            }
            self.cond.wait(&mut result);
        }
    }
}

enum Slot {
    Live(Weak<Onode>),
    Loading(Arc<LoadState>),
}

pub(crate) struct OnodeCache {
    cid: CollectionId,
    map: RwLock<HashMap<Oid, Slot>>,
}

impl OnodeCache {
    pub fn new(cid: CollectionId) -> Self {
        Self {
            cid,
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Install an already-built onode (collection move/rename).
    pub fn insert_live(&self, onode: &Arc<Onode>) {
        self.map
            .write()
            .insert(onode.oid.clone(), Slot::Live(Arc::downgrade(onode)));
    }

    /// Look up or load an onode.
    ///
    /// With `create = true` a miss constructs a fresh dirty record (the
    /// caller is about to materialize the object). With `create = false` a
    /// miss returns `None`.
    pub fn get(
        &self,
        db: &Arc<dyn KvEngine>,
        oid: &Oid,
        create: bool,
    ) -> Result<Option<Arc<Onode>>> {
        loop {
            // fast path under the read lock
            let waiter = {
                let map = self.map.read();
                match map.get(oid) {
                    Some(Slot::Live(weak)) => {
                        if let Some(onode) = weak.upgrade() {
                            return Ok(Some(onode));
                        }
                        None
                    }
                    Some(Slot::Loading(state)) => Some(Arc::clone(state)),
                    None => None,
                }
            };

            if let Some(state) = waiter {
                match state.wait() {
                    Some(onode) => return Ok(Some(onode)),
                    // the loader found nothing; retry so a create can
                    // materialize the record ourselves
                    None if create => continue,
                    None => return Ok(None),
                }
            }

            // become the loader (or discover someone else already did)
            let state = Arc::new(LoadState {
                result: Mutex::new(None),
                cond: Condvar::new(),
            });
            {
                let mut map = self.map.write();
                match map.get(oid) {
                    Some(Slot::Live(weak)) => {
                        if let Some(onode) = weak.upgrade() {
                            return Ok(Some(onode));
                        }
                    }
                    Some(Slot::Loading(_)) => continue,
                    None => {}
                }
                map.insert(oid.clone(), Slot::Loading(Arc::clone(&state)));
            }

            let key = keys::object_key(&self.cid, oid);
            let loaded = db.get(Prefix::Obj, &key);

            let mut map = self.map.write();
            map.remove(oid);
            return match loaded {
                Ok(Some(bytes)) => {
                    let record: OnodeRecord = match bincode::deserialize(&bytes) {
                        Ok(record) => record,
                        Err(e) => {
                            state.publish(None);
                            return Err(fragstore_core::Error::Corrupt(format!(
                                "undecodable onode for {}: {}",
                                oid, e
                            )));
                        }
                    };
                    let onode = Onode::new(oid.clone(), key, record, true, false);
                    map.insert(oid.clone(), Slot::Live(Arc::downgrade(&onode)));
                    state.publish(Some(Arc::clone(&onode)));
                    Ok(Some(onode))
                }
                Ok(None) if create => {
                    let onode = Onode::new(oid.clone(), key, OnodeRecord::default(), true, true);
                    map.insert(oid.clone(), Slot::Live(Arc::downgrade(&onode)));
                    state.publish(Some(Arc::clone(&onode)));
                    Ok(Some(onode))
                }
                Ok(None) => {
                    state.publish(None);
                    Ok(None)
                }
                Err(e) => {
                    state.publish(None);
                    Err(e)
                }
            };
        }
    }

    /// Drop a cached entry, forcing the next lookup to reload from kv.
    pub fn remove(&self, oid: &Oid) {
        self.map.write().remove(oid);
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.map.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragstore_core::keys::object_key;
    use fragstore_kv::{Batch, MemEngine};

    fn db_with(cid: &CollectionId, oid: &Oid, record: &OnodeRecord) -> Arc<dyn KvEngine> {
        let db = MemEngine::new();
        let mut batch = Batch::new();
        batch.set(
            Prefix::Obj,
            object_key(cid, oid),
            bincode::serialize(record).unwrap(),
        );
        db.commit(batch).unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_miss_without_create() {
        let db: Arc<dyn KvEngine> = Arc::new(MemEngine::new());
        let cache = OnodeCache::new(CollectionId::new("c"));
        assert!(cache.get(&db, &Oid::head("o"), false).unwrap().is_none());
    }

    #[test]
    fn test_miss_with_create_makes_dirty_record() {
        let db: Arc<dyn KvEngine> = Arc::new(MemEngine::new());
        let cache = OnodeCache::new(CollectionId::new("c"));
        let onode = cache.get(&db, &Oid::head("o"), true).unwrap().unwrap();
        let state = onode.lock();
        assert!(state.dirty);
        assert!(state.exists);
        assert_eq!(state.record.size, 0);
    }

    #[test]
    fn test_load_from_kv() {
        let cid = CollectionId::new("c");
        let oid = Oid::head("o");
        let record = OnodeRecord {
            size: 42,
            ..Default::default()
        };
        let db = db_with(&cid, &oid, &record);
        let cache = OnodeCache::new(cid);
        let onode = cache.get(&db, &oid, false).unwrap().unwrap();
        assert_eq!(onode.lock().record.size, 42);
        assert!(!onode.lock().dirty);
    }

    #[test]
    fn test_live_hit_returns_same_onode() {
        let db: Arc<dyn KvEngine> = Arc::new(MemEngine::new());
        let cache = OnodeCache::new(CollectionId::new("c"));
        let oid = Oid::head("o");
        let a = cache.get(&db, &oid, true).unwrap().unwrap();
        let b = cache.get(&db, &oid, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_eviction_after_last_strong_ref() {
        let cid = CollectionId::new("c");
        let oid = Oid::head("o");
        let record = OnodeRecord {
            size: 7,
            ..Default::default()
        };
        let db = db_with(&cid, &oid, &record);
        let cache = OnodeCache::new(cid);

        let a = cache.get(&db, &oid, false).unwrap().unwrap();
        drop(a);
        // the weak slot is dead; lookup reloads from kv
        let b = cache.get(&db, &oid, false).unwrap().unwrap();
        assert_eq!(b.lock().record.size, 7);
    }

    #[test]
    fn test_concurrent_lookups_coalesce() {
        let cid = CollectionId::new("c");
        let oid = Oid::head("o");
        let record = OnodeRecord {
            size: 9,
            ..Default::default()
        };
        let db = db_with(&cid, &oid, &record);
        let cache = Arc::new(OnodeCache::new(cid));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let db = Arc::clone(&db);
            let oid = oid.clone();
            handles.push(std::thread::spawn(move || {
                cache.get(&db, &oid, false).unwrap().unwrap()
            }));
        }
        let onodes: Vec<Arc<Onode>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for o in &onodes[1..] {
            assert!(Arc::ptr_eq(&onodes[0], o));
        }
    }
}
