//! The object store: lifecycle, collections, and the read surface
//!
//! `FragStore` composes the path/fsid manager, the fragment allocator, the
//! kv adapter, the per-collection onode caches, the sequencer registry, and
//! the two background workers. Submission and the per-op handlers live in
//! the sibling `txn` module.

mod txn;

use crate::cache::OnodeCache;
use crate::finisher::Finisher;
use crate::fragments::FragmentAllocator;
use crate::onode::Onode;
use crate::paths::{FsidFile, StorePaths};
use crate::sequencer::{OpSequencer, Sequencer};
use crate::wal;
use fragstore_core::{
    keys, CollectionId, Error, Oid, Result, StoreConfig, Superblock, SUPERBLOCK_VERSION,
};
use fragstore_kv::{open_backend, Batch, KvEngine, Prefix};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use tracing::{info, warn};
use uuid::Uuid;

const SUPERBLOCK_KEY: &[u8] = b"superblock";

/// Object metadata returned by [`FragStore::stat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Logical object length in bytes
    pub size: u64,
}

/// Filesystem capacity under the store root
#[derive(Debug, Clone, Copy)]
pub struct StoreStatfs {
    /// Total bytes on the hosting filesystem
    pub total_bytes: u64,
    /// Free bytes
    pub free_bytes: u64,
    /// Bytes available to unprivileged users
    pub available_bytes: u64,
}

/// A namespace of objects with its own onode cache
pub(crate) struct Collection {
    pub cid: CollectionId,
    pub cache: OnodeCache,
    /// Advisory expected (objects, bytes) from a collection hint
    pub hint: Mutex<Option<(u64, u64)>>,
}

impl Collection {
    fn new(cid: CollectionId) -> Arc<Self> {
        Arc::new(Self {
            cache: OnodeCache::new(cid.clone()),
            cid,
            hint: Mutex::new(None),
        })
    }
}

pub(crate) type CollectionRef = Arc<Collection>;

/// Everything that only exists while the store is mounted.
pub(crate) struct MountedStore {
    pub paths: StorePaths,
    pub config: StoreConfig,
    pub db: Arc<dyn KvEngine>,
    pub allocator: Arc<FragmentAllocator>,
    pub colls: RwLock<HashMap<CollectionId, CollectionRef>>,
    /// Internal sequencers bound during this mount, drained at umount
    pub sequencers: Mutex<Vec<Weak<OpSequencer>>>,
    /// Next wal sequence is `fetch_add + 1`
    pub wal_seq: AtomicU64,
    pub superblock: Mutex<Superblock>,
    /// Invokes readable/commit callbacks
    pub finisher: Finisher,
    /// Replays committed wal transactions against fragment files
    pub wal_applier: Finisher,
    pub default_osr: Sequencer,
    /// Held for the mount lifetime; dropping releases the advisory lock
    _fsid_file: FsidFile,
}

/// An object store instance rooted at one directory.
///
/// Format with [`mkfs`](Self::mkfs), attach with [`mount`](Self::mount),
/// submit work with [`queue_transactions`](Self::queue_transactions), and
/// detach with [`umount`](Self::umount).
pub struct FragStore {
    paths: StorePaths,
    config: StoreConfig,
    injected_fsid: Mutex<Option<Uuid>>,
    /// For the "memory" backend the engine must survive mkfs → mount within
    /// one instance, so it is cached here.
    mem_db: OnceCell<Arc<dyn KvEngine>>,
    state: RwLock<Option<Arc<MountedStore>>>,
}

fn read_superblock(db: &dyn KvEngine) -> Result<Option<Superblock>> {
    match db.get(Prefix::Super, SUPERBLOCK_KEY)? {
        None => Ok(None),
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(|e| {
            Error::Corrupt(format!("undecodable superblock: {}", e))
        })?)),
    }
}

fn write_superblock(db: &dyn KvEngine, sb: &Superblock) -> Result<()> {
    let mut batch = Batch::new();
    batch.set(Prefix::Super, SUPERBLOCK_KEY, bincode::serialize(sb)?);
    db.commit(batch)
}

impl FragStore {
    /// Create a store instance for `path`. Nothing is opened until
    /// `mkfs`/`mount`.
    pub fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            paths: StorePaths::new(path),
            config,
            injected_fsid: Mutex::new(None),
            mem_db: OnceCell::new(),
            state: RwLock::new(None),
        })
    }

    /// The store root directory.
    pub fn path(&self) -> &Path {
        self.paths.root()
    }

    /// Inject the instance identifier to expect (or write at format time).
    pub fn set_fsid(&self, fsid: Uuid) {
        *self.injected_fsid.lock() = Some(fsid);
    }

    /// The instance identifier, once known.
    pub fn get_fsid(&self) -> Option<Uuid> {
        *self.injected_fsid.lock()
    }

    /// Whether the store is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.state.read().is_some()
    }

    fn open_db(&self) -> Result<Arc<dyn KvEngine>> {
        if self.config.kv_backend == "memory" {
            let db = self
                .mem_db
                .get_or_try_init(|| open_backend("memory", &self.paths.db_dir()))?;
            Ok(Arc::clone(db))
        } else {
            open_backend(&self.config.kv_backend, &self.paths.db_dir())
        }
    }

    pub(crate) fn mounted(&self) -> Result<Arc<MountedStore>> {
        self.state
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::InvalidArgument("store is not mounted".to_string()))
    }

    /// Format the store: provision directories, establish the fsid, open the
    /// kv backend, and persist the superblock. Leaves the store unmounted.
    pub fn mkfs(&self) -> Result<()> {
        info!(path = %self.paths.root().display(), "formatting object store");
        self.paths.create_layout()?;

        let mut fsid_file = FsidFile::open(&self.paths, true)?;
        fsid_file.lock(&self.paths)?;
        let on_disk = fsid_file.read()?;
        let injected = *self.injected_fsid.lock();
        let fsid = match (on_disk, injected) {
            (Some(disk), Some(given)) if disk != given => {
                return Err(Error::Mismatch {
                    on_disk: disk,
                    supplied: given,
                })
            }
            (Some(disk), _) => disk,
            (None, Some(given)) => {
                fsid_file.write(given)?;
                given
            }
            (None, None) => {
                let generated = Uuid::new_v4();
                fsid_file.write(generated)?;
                generated
            }
        };
        *self.injected_fsid.lock() = Some(fsid);

        let db = self.open_db()?;
        match read_superblock(db.as_ref())? {
            Some(sb) => {
                if sb.version != SUPERBLOCK_VERSION {
                    return Err(Error::Corrupt(format!(
                        "superblock version {} is not supported",
                        sb.version
                    )));
                }
                if sb.fsid != fsid {
                    return Err(Error::Corrupt(
                        "superblock fsid disagrees with fsid file".to_string(),
                    ));
                }
            }
            None => {
                write_superblock(
                    db.as_ref(),
                    &Superblock {
                        version: SUPERBLOCK_VERSION,
                        fsid,
                        fid_watermark: fragstore_core::Fid::none(),
                    },
                )?;
            }
        }
        info!(%fsid, "formatted object store");
        Ok(())
    }

    /// Attach to a formatted store: verify identity, take the exclusive
    /// lock, replay the write-ahead log, and start the workers.
    pub fn mount(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(Error::InUse("store is already mounted".to_string()));
        }
        self.paths.validate()?;

        let mut fsid_file = FsidFile::open(&self.paths, false)?;
        let fsid = fsid_file
            .read()?
            .ok_or_else(|| Error::Corrupt("store has no fsid".to_string()))?;
        if let Some(injected) = *self.injected_fsid.lock() {
            if injected != fsid {
                return Err(Error::Mismatch {
                    on_disk: fsid,
                    supplied: injected,
                });
            }
        }
        fsid_file.lock(&self.paths)?;

        let db = self.open_db()?;
        let sb = read_superblock(db.as_ref())?
            .ok_or_else(|| Error::Corrupt("store has no superblock".to_string()))?;
        if sb.version != SUPERBLOCK_VERSION {
            return Err(Error::Corrupt(format!(
                "superblock version {} is not supported",
                sb.version
            )));
        }
        if sb.fsid != fsid {
            return Err(Error::Corrupt(
                "superblock fsid disagrees with fsid file".to_string(),
            ));
        }

        // the watermark survives crashes via the superblock; the directory
        // scan catches files created after the last staged update
        let scanned = FragmentAllocator::scan_watermark(&self.paths)?;
        let watermark = sb.fid_watermark.max(scanned);
        let allocator = Arc::new(FragmentAllocator::new(
            self.paths.clone(),
            self.config.max_bucket_size,
            watermark,
        ));

        let (max_seq, replayed) = wal::replay(db.as_ref(), &allocator)?;

        let mut colls = HashMap::new();
        for (key, _) in db.scan(Prefix::Coll, &[], None)? {
            let name = String::from_utf8(key)
                .map_err(|e| Error::Corrupt(format!("non-utf8 collection id: {}", e)))?;
            let cid = CollectionId::new(name);
            colls.insert(cid.clone(), Collection::new(cid));
        }

        let mounted = Arc::new(MountedStore {
            paths: self.paths.clone(),
            config: self.config.clone(),
            db,
            allocator,
            colls: RwLock::new(colls),
            sequencers: Mutex::new(Vec::new()),
            wal_seq: AtomicU64::new(max_seq),
            superblock: Mutex::new(Superblock {
                fid_watermark: watermark,
                ..sb
            }),
            finisher: Finisher::new("fragstore-finisher"),
            wal_applier: Finisher::new("fragstore-wal-apply"),
            default_osr: Sequencer::new(),
            _fsid_file: fsid_file,
        });
        *self.injected_fsid.lock() = Some(fsid);
        *state = Some(mounted);
        info!(
            path = %self.paths.root().display(),
            %fsid,
            wal_replayed = replayed,
            "mounted object store"
        );
        Ok(())
    }

    /// Detach: drain sequencers and workers, persist the fid watermark,
    /// close the kv backend, and release the fsid lock.
    pub fn umount(&self) -> Result<()> {
        let mounted = self
            .state
            .write()
            .take()
            .ok_or_else(|| Error::InvalidArgument("store is not mounted".to_string()))?;

        let live: Vec<Arc<OpSequencer>> = mounted
            .sequencers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for osr in live {
            osr.flush();
        }

        if !mounted.config.defer_wal_apply {
            mounted.wal_applier.drain();
        }
        mounted.wal_applier.shutdown();
        mounted.finisher.drain();
        mounted.finisher.shutdown();

        let sb = {
            let mut sb = mounted.superblock.lock();
            sb.fid_watermark = mounted.allocator.current();
            sb.clone()
        };
        write_superblock(mounted.db.as_ref(), &sb)?;

        info!(path = %self.paths.root().display(), "unmounted object store");
        Ok(())
    }

    // ------------------------------------------------------------------
    // read surface

    /// Read `length` bytes of an object starting at `offset`, clamped to
    /// the object size.
    pub fn read(
        &self,
        cid: &CollectionId,
        oid: &Oid,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        o.wait_unapplied();
        let state = o.lock();
        let size = state.record.size;
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = size.min(offset.saturating_add(length));
        m.read_extents(&state.record, offset, end)
    }

    /// Object metadata.
    pub fn stat(&self, cid: &CollectionId, oid: &Oid) -> Result<Stat> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        o.wait_unapplied();
        let size = o.lock().record.size;
        Ok(Stat { size })
    }

    /// Whether an object exists.
    pub fn exists(&self, cid: &CollectionId, oid: &Oid) -> Result<bool> {
        let m = self.mounted()?;
        let Ok(c) = m.get_collection(cid) else {
            return Ok(false);
        };
        match c.cache.get(&m.db, oid, false)? {
            Some(o) => Ok(o.lock().exists),
            None => Ok(false),
        }
    }

    /// One attribute value; `NoData` when the attribute is absent.
    pub fn getattr(&self, cid: &CollectionId, oid: &Oid, name: &str) -> Result<Vec<u8>> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        let state = o.lock();
        state
            .record
            .attrs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoData(format!("attr {:?} on {}", name, oid)))
    }

    /// All attributes of an object.
    pub fn getattrs(&self, cid: &CollectionId, oid: &Oid) -> Result<BTreeMap<String, Vec<u8>>> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        let state = o.lock();
        Ok(state.record.attrs.clone())
    }

    /// Every collection, in id order.
    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        let m = self.mounted()?;
        let mut out = Vec::new();
        for (key, _) in m.db.scan(Prefix::Coll, &[], None)? {
            let name = String::from_utf8(key)
                .map_err(|e| Error::Corrupt(format!("non-utf8 collection id: {}", e)))?;
            out.push(CollectionId::new(name));
        }
        Ok(out)
    }

    /// Whether a collection exists.
    pub fn collection_exists(&self, cid: &CollectionId) -> Result<bool> {
        let m = self.mounted()?;
        Ok(m.db.get(Prefix::Coll, cid.as_str().as_bytes())?.is_some())
    }

    /// Whether a collection holds no objects. Consults the kv store, not
    /// the cache.
    pub fn collection_empty(&self, cid: &CollectionId) -> Result<bool> {
        let m = self.mounted()?;
        let (start, end) = keys::collection_range(cid);
        Ok(m.db.scan(Prefix::Obj, &start, Some(&end))?.is_empty())
    }

    /// Every object of a collection, in canonical oid order.
    pub fn collection_list(&self, cid: &CollectionId) -> Result<Vec<Oid>> {
        let m = self.mounted()?;
        if !self.collection_exists(cid)? {
            return Err(Error::NotFound(format!("collection {}", cid)));
        }
        let (start, end) = keys::collection_range(cid);
        let mut out = Vec::new();
        for (key, _) in m.db.scan(Prefix::Obj, &start, Some(&end))? {
            let (_, oid) = keys::decode_object_key(&key)?;
            out.push(oid);
        }
        Ok(out)
    }

    /// The omap header blob, if one was set.
    pub fn omap_get_header(&self, cid: &CollectionId, oid: &Oid) -> Result<Option<Vec<u8>>> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        m.db.get(Prefix::Omap, &o.key)
    }

    /// Every omap key of an object, in order.
    pub fn omap_get_keys(&self, cid: &CollectionId, oid: &Oid) -> Result<Vec<Vec<u8>>> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        let (start, end) = keys::omap_entry_range(&o.key);
        let rows = m.db.scan(Prefix::Omap, &start, Some(&end))?;
        Ok(rows
            .into_iter()
            .map(|(k, _)| k[o.key.len()..].to_vec())
            .collect())
    }

    /// Values for specific omap keys; absent keys are skipped.
    pub fn omap_get_values(
        &self,
        cid: &CollectionId,
        oid: &Oid,
        keys_wanted: &[Vec<u8>],
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        let mut out = BTreeMap::new();
        for k in keys_wanted {
            let mut row_key = o.key.clone();
            row_key.extend_from_slice(k);
            if let Some(v) = m.db.get(Prefix::Omap, &row_key)? {
                out.insert(k.clone(), v);
            }
        }
        Ok(out)
    }

    /// Header and all entries of an object's omap.
    pub fn omap_get(
        &self,
        cid: &CollectionId,
        oid: &Oid,
    ) -> Result<(Option<Vec<u8>>, BTreeMap<Vec<u8>, Vec<u8>>)> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let o = m.require_onode(&c, oid)?;
        let header = m.db.get(Prefix::Omap, &o.key)?;
        let (start, end) = keys::omap_entry_range(&o.key);
        let mut entries = BTreeMap::new();
        for (k, v) in m.db.scan(Prefix::Omap, &start, Some(&end))? {
            entries.insert(k[o.key.len()..].to_vec(), v);
        }
        Ok((header, entries))
    }

    /// Capacity of the filesystem hosting the store.
    ///
    /// With `fail_eio` set (the default), an `EIO` here means the device is
    /// failing under the store and the process halts.
    pub fn statfs(&self) -> Result<StoreStatfs> {
        let m = self.mounted()?;
        match fs2::statvfs(m.paths.root()) {
            Ok(s) => Ok(StoreStatfs {
                total_bytes: s.total_space(),
                free_bytes: s.free_space(),
                available_bytes: s.available_space(),
            }),
            Err(e) => {
                if e.raw_os_error() == Some(libc::EIO) && m.config.fail_eio {
                    panic!(
                        "fragstore: EIO from statfs on {}",
                        m.paths.root().display()
                    );
                }
                Err(Error::Io(e))
            }
        }
    }

    /// The advisory (objects, bytes) hint recorded for a collection.
    pub fn collection_hint(&self, cid: &CollectionId) -> Result<Option<(u64, u64)>> {
        let m = self.mounted()?;
        let c = m.get_collection(cid)?;
        let hint = *c.hint.lock();
        Ok(hint)
    }

    /// Number of write-ahead-log rows not yet applied (diagnostics; zero at
    /// every quiescent point).
    pub fn wal_pending(&self) -> Result<usize> {
        let m = self.mounted()?;
        wal::pending(m.db.as_ref())
    }
}

impl Drop for FragStore {
    fn drop(&mut self) {
        if self.state.read().is_some() {
            if let Err(e) = self.umount() {
                warn!(error = %e, "umount on drop failed");
            }
        }
    }
}

impl MountedStore {
    pub(crate) fn get_collection(&self, cid: &CollectionId) -> Result<CollectionRef> {
        self.colls
            .read()
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("collection {}", cid)))
    }

    /// Look up an existing, live onode for the read surface.
    pub(crate) fn require_onode(&self, c: &CollectionRef, oid: &Oid) -> Result<Arc<Onode>> {
        match c.cache.get(&self.db, oid, false)? {
            Some(o) if o.lock().exists => Ok(o),
            _ => Err(Error::NotFound(format!("{}/{}", c.cid, oid))),
        }
    }

    /// Assemble `[offset, end)` from the data map. Sparse tails inside a
    /// fragment file read back as zeros.
    pub(crate) fn read_extents(
        &self,
        record: &fragstore_core::OnodeRecord,
        offset: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (end - offset) as usize];
        for extent in &record.data_map {
            let seg_start = extent.logical_offset.max(offset);
            let seg_end = extent.end().min(end);
            if seg_start >= seg_end {
                continue;
            }
            let Some(file) = self.allocator.open_fid(extent.fid, false)? else {
                return Err(Error::Corrupt(format!(
                    "fragment {} referenced but missing on disk",
                    extent.fid
                )));
            };
            let mut file_off = seg_start - extent.logical_offset;
            let mut buf_off = (seg_start - offset) as usize;
            let mut remaining = (seg_end - seg_start) as usize;
            while remaining > 0 {
                let n = file
                    .read_at(&mut buf[buf_off..buf_off + remaining], file_off)
                    .map_err(Error::Io)?;
                if n == 0 {
                    break; // hole past the file's end stays zero
                }
                file_off += n as u64;
                buf_off += n;
                remaining -= n;
            }
        }
        Ok(buf)
    }
}
