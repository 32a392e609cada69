//! Transaction staging and the commit pipeline
//!
//! Submissions resolve their sequencer, walk each opcode staging onode
//! mutations, fragment writes, and wal ops into a transaction context, then
//! run the pipeline: encode dirty onodes into the kv batch, fsync fresh
//! fragment files, commit the batch atomically, unlink removed fragments,
//! dispatch callbacks, and hand any wal work to the apply worker.
//!
//! Per-op failures pass through a tolerance filter: `NotFound` from
//! read-modify ops and `NoData` are swallowed (clone ops excepted);
//! `NoSpace` halts the process; anything else dumps the transaction and
//! aborts the submission with nothing committed.

use super::{Collection, CollectionRef, FragStore, MountedStore};
use crate::onode::Onode;
use crate::sequencer::Sequencer;
use crate::transaction::{Callback, Op, Transaction, COLL_HINT_EXPECTED_OBJECTS};
use crate::txc::TransContext;
use crate::wal::{self, WalOp};
use fragstore_core::{keys, CollectionId, Error, FragmentExtent, Oid, Result};
use fragstore_kv::Prefix;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A piece of a logical byte range mapped onto one fragment file
struct Segment {
    fid: fragstore_core::Fid,
    file_offset: u64,
    logical_start: u64,
    length: u64,
}

/// Map `[start, end)` onto the covering fragments.
fn map_extents(data_map: &[FragmentExtent], start: u64, end: u64) -> Vec<Segment> {
    let mut out = Vec::new();
    for extent in data_map {
        let seg_start = extent.logical_offset.max(start);
        let seg_end = extent.end().min(end);
        if seg_start < seg_end {
            out.push(Segment {
                fid: extent.fid,
                file_offset: seg_start - extent.logical_offset,
                logical_start: seg_start,
                length: seg_end - seg_start,
            });
        }
    }
    out
}

impl FragStore {
    /// Submit transactions on a sequencer.
    ///
    /// Returns once the batch is durably committed and readable. Commit
    /// order on one sequencer equals submission order; distinct sequencers
    /// are unordered.
    pub fn queue_transactions(&self, seq: &Sequencer, txns: Vec<Transaction>) -> Result<()> {
        self.queue_transactions_with(seq, txns, None, None)
    }

    /// Submit with completion callbacks: `on_readable` fires as soon as the
    /// staged state is visible, `on_commit` after the durable kv commit.
    /// Both run on the finisher thread.
    pub fn queue_transactions_with(
        &self,
        seq: &Sequencer,
        txns: Vec<Transaction>,
        on_readable: Option<Callback>,
        on_commit: Option<Callback>,
    ) -> Result<()> {
        let m = self.mounted()?;
        m.submit(seq, txns, on_readable, on_commit)
    }

    /// Submit opaque encoded transaction streams.
    pub fn queue_encoded_transactions(
        &self,
        seq: &Sequencer,
        streams: Vec<Vec<u8>>,
    ) -> Result<()> {
        let txns = streams
            .iter()
            .map(|bytes| Transaction::decode(bytes))
            .collect::<Result<Vec<_>>>()?;
        self.queue_transactions(seq, txns)
    }

    /// Submit one transaction on the store's default sequencer.
    pub fn apply_transaction(&self, txn: Transaction) -> Result<()> {
        let m = self.mounted()?;
        let seq: &Sequencer = &m.default_osr;
        m.submit(seq, vec![txn], None, None)
    }
}

impl MountedStore {
    pub(crate) fn submit(
        &self,
        seq: &Sequencer,
        txns: Vec<Transaction>,
        on_readable: Option<Callback>,
        on_commit: Option<Callback>,
    ) -> Result<()> {
        let osr = seq.bind_with(|| {
            let osr = crate::sequencer::OpSequencer::new();
            self.sequencers.lock().push(Arc::downgrade(&osr));
            osr
        });

        // serializes this ordering domain's whole pipeline: commit order on
        // one sequencer is submission order
        let _ordering = osr.submit_lock.lock();
        let txc = Arc::new(TransContext::new(Arc::clone(&osr)));
        osr.queue(Arc::clone(&txc));

        let result = (|| {
            for txn in &txns {
                self.apply_ops(&txc, txn)?;
            }
            self.finalize_and_commit(&txc, on_readable, on_commit)
        })();

        txc.osr.dequeue(&txc);
        if result.is_err() {
            // staged in-memory state may diverge from kv; force reloads
            self.invalidate_caches();
        }
        result
    }

    /// After an aborted submission the staged in-memory state (onode
    /// records, collection map entries) may diverge from kv. Rebuild the
    /// collection map from the committed rows and drop every cached onode
    /// so later lookups reload.
    fn invalidate_caches(&self) {
        let mut colls = self.colls.write();
        match self.db.scan(Prefix::Coll, &[], None) {
            Ok(rows) => {
                let mut fresh = HashMap::new();
                for (key, _) in rows {
                    if let Ok(name) = String::from_utf8(key) {
                        let cid = CollectionId::new(name);
                        let c = colls
                            .remove(&cid)
                            .unwrap_or_else(|| Collection::new(cid.clone()));
                        c.cache.clear();
                        fresh.insert(cid, c);
                    }
                }
                *colls = fresh;
            }
            Err(e) => {
                warn!(error = %e, "collection rescan after abort failed");
                for c in colls.values() {
                    c.cache.clear();
                }
            }
        }
    }

    fn apply_ops(&self, txc: &Arc<TransContext>, txn: &Transaction) -> Result<()> {
        for op in txn.ops() {
            match self.do_op(txc, op) {
                Ok(()) => {}
                Err(Error::NoSpace) => {
                    error!(txn = ?txn, "out of space while applying transaction");
                    panic!("fragstore: out of space while applying a transaction");
                }
                Err(e) => {
                    // clone ops must see their source; everyone else
                    // tolerates missing objects and missing attrs
                    let tolerated = !matches!(op, Op::Clone { .. } | Op::CloneRange { .. })
                        && e.is_tolerated_in_txn();
                    if tolerated {
                        debug!(error = %e, "tolerated op failure, treating as no-op");
                        continue;
                    }
                    error!(error = %e, txn = ?txn, "aborting transaction");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn do_op(&self, txc: &Arc<TransContext>, op: &Op) -> Result<()> {
        match op {
            Op::Nop => Ok(()),
            Op::Touch { cid, oid } => {
                let c = self.resolve_collection(cid)?;
                self.do_touch(txc, &c, oid)
            }
            Op::Write {
                cid,
                oid,
                offset,
                data,
                flags: _,
            } => {
                let c = self.resolve_collection(cid)?;
                self.do_write(txc, &c, oid, *offset, data)
            }
            Op::Zero {
                cid,
                oid,
                offset,
                length,
            } => {
                let c = self.resolve_collection(cid)?;
                self.do_zero(txc, &c, oid, *offset, *length)
            }
            Op::Truncate { cid, oid, size } => {
                let c = self.resolve_collection(cid)?;
                self.do_truncate(txc, &c, oid, *size)
            }
            Op::Remove { cid, oid } => {
                let c = self.resolve_collection(cid)?;
                self.do_remove(txc, &c, oid)
            }
            Op::SetAttr {
                cid,
                oid,
                name,
                value,
            } => {
                let c = self.resolve_collection(cid)?;
                self.do_setattrs(txc, &c, oid, [(name.clone(), value.clone())].into())
            }
            Op::SetAttrs { cid, oid, attrs } => {
                let c = self.resolve_collection(cid)?;
                self.do_setattrs(txc, &c, oid, attrs.clone())
            }
            Op::RmAttr { cid, oid, name } => {
                let c = self.resolve_collection(cid)?;
                self.do_rmattr(txc, &c, oid, name)
            }
            Op::RmAttrs { cid, oid } => {
                let c = self.resolve_collection(cid)?;
                self.do_rmattrs(txc, &c, oid)
            }
            Op::Clone { cid, src, dst } => {
                let c = self.resolve_collection(cid)?;
                self.do_clone(txc, &c, src, dst)
            }
            Op::CloneRange {
                cid,
                src,
                dst,
                src_offset,
                length,
                dst_offset,
            } => {
                let c = self.resolve_collection(cid)?;
                self.do_clone_range(txc, &c, src, dst, *src_offset, *length, *dst_offset)
            }
            Op::MkColl { cid } => self.do_mkcoll(txc, cid),
            Op::RmColl { cid } => self.do_rmcoll(txc, cid),
            Op::CollMoveRename {
                src_cid,
                src_oid,
                dst_cid,
                dst_oid,
            } => self.do_coll_move_rename(txc, src_cid, src_oid, dst_cid, dst_oid),
            Op::OmapClear { cid, oid } => {
                let c = self.resolve_collection(cid)?;
                self.do_omap_clear(txc, &c, oid)
            }
            Op::OmapSetKeys { cid, oid, entries } => {
                let c = self.resolve_collection(cid)?;
                self.do_omap_setkeys(txc, &c, oid, entries)
            }
            Op::OmapRmKeys { cid, oid, keys } => {
                let c = self.resolve_collection(cid)?;
                self.do_omap_rmkeys(txc, &c, oid, keys)
            }
            Op::OmapRmKeyRange {
                cid,
                oid,
                first,
                last,
            } => {
                let c = self.resolve_collection(cid)?;
                self.do_omap_rmkeyrange(txc, &c, oid, first, last)
            }
            Op::OmapSetHeader { cid, oid, header } => {
                let c = self.resolve_collection(cid)?;
                self.do_omap_setheader(txc, &c, oid, header)
            }
            Op::SplitCollection {
                cid,
                bits,
                rem,
                dest,
            } => self.do_split_collection(txc, cid, *bits, *rem, dest),
            Op::CollHint { cid, code, payload } => self.do_coll_hint(cid, *code, payload),
            Op::SetAllocHint {
                cid,
                oid,
                expected_object_size,
                expected_write_size,
            } => {
                let c = self.resolve_collection(cid)?;
                self.do_set_alloc_hint(txc, &c, oid, *expected_object_size, *expected_write_size)
            }
        }
    }

    /// Resolve a collection for a mutating op. A missing collection is
    /// stale caller state, not a missing object: the tolerance filter must
    /// not swallow it, so it surfaces as `InvalidArgument`.
    fn resolve_collection(&self, cid: &CollectionId) -> Result<CollectionRef> {
        self.get_collection(cid)
            .map_err(|_| Error::InvalidArgument(format!("collection {} does not exist", cid)))
    }

    /// Look up an onode for a mutating op. `create = true` materializes a
    /// fresh record on miss and resurrects tombstones; `create = false`
    /// reports `NotFound` for both.
    fn get_onode(&self, c: &CollectionRef, oid: &Oid, create: bool) -> Result<Arc<Onode>> {
        match c.cache.get(&self.db, oid, create)? {
            Some(o) => {
                if create {
                    let mut state = o.lock();
                    if !state.exists {
                        state.exists = true;
                        state.dirty = true;
                    }
                } else if !o.lock().exists {
                    return Err(Error::NotFound(format!("{}/{}", c.cid, oid)));
                }
                Ok(o)
            }
            None => Err(Error::NotFound(format!("{}/{}", c.cid, oid))),
        }
    }

    fn do_touch(&self, txc: &TransContext, c: &CollectionRef, oid: &Oid) -> Result<()> {
        let o = self.get_onode(c, oid, true)?;
        o.lock().dirty = true;
        txc.write_onode(&o);
        Ok(())
    }

    /// The write policy:
    /// - empty object, append at `size`, or a start past `size`: one fresh
    ///   fragment (gaps stay sparse and read back as zeros)
    /// - strictly inside existing data: wal ops against the overlapped
    ///   fragment files, no synchronous data mutation
    /// - overlap plus extension: wal overwrite for the overlap, fresh
    ///   fragment for the tail
    fn do_write(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let o = self.get_onode(c, oid, true)?;
        let mut state = o.lock();
        if data.is_empty() {
            state.dirty = true;
            drop(state);
            txc.write_onode(&o);
            return Ok(());
        }
        let end = offset + data.len() as u64;
        let size = state.record.size;

        if size == 0 || offset >= size {
            let (fid, file) = self.allocator.allocate()?;
            txc.note_allocated_fid();
            file.write_all_at(data, offset - size).map_err(Error::from_io)?;
            txc.sync_fd(file);
            state.record.data_map.push(FragmentExtent {
                logical_offset: size,
                length: end - size,
                fid,
            });
            state.record.size = end;
        } else {
            let overlap_end = end.min(size);
            let ops: Vec<WalOp> = map_extents(&state.record.data_map, offset, overlap_end)
                .into_iter()
                .map(|seg| {
                    let from = (seg.logical_start - offset) as usize;
                    WalOp::Write {
                        fid: seg.fid,
                        offset: seg.file_offset,
                        data: data[from..from + seg.length as usize].to_vec(),
                    }
                })
                .collect();
            txc.push_wal_ops(&self.wal_seq, ops);

            if end > size {
                let (fid, file) = self.allocator.allocate()?;
                txc.note_allocated_fid();
                let tail = &data[(size - offset) as usize..];
                file.write_all_at(tail, 0).map_err(Error::from_io)?;
                txc.sync_fd(file);
                state.record.data_map.push(FragmentExtent {
                    logical_offset: size,
                    length: end - size,
                    fid,
                });
                state.record.size = end;
            }
        }
        state.dirty = true;
        drop(state);
        txc.write_onode(&o);
        Ok(())
    }

    fn do_zero(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        if length == 0 {
            return Ok(());
        }
        let mut state = o.lock();
        let end = offset + length;
        let size = state.record.size;

        if offset < size {
            let overlap_end = end.min(size);
            let ops: Vec<WalOp> = map_extents(&state.record.data_map, offset, overlap_end)
                .into_iter()
                .map(|seg| WalOp::Zero {
                    fid: seg.fid,
                    offset: seg.file_offset,
                    length: seg.length,
                })
                .collect();
            txc.push_wal_ops(&self.wal_seq, ops);
        }
        if end > size {
            // zero-extend with a sparse fragment
            let (fid, file) = self.allocator.allocate()?;
            txc.note_allocated_fid();
            file.set_len(end - size).map_err(Error::from_io)?;
            txc.sync_fd(file);
            state.record.data_map.push(FragmentExtent {
                logical_offset: size,
                length: end - size,
                fid,
            });
            state.record.size = end;
        }
        state.dirty = true;
        drop(state);
        txc.write_onode(&o);
        Ok(())
    }

    fn do_truncate(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        new_size: u64,
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        let mut state = o.lock();
        let size = state.record.size;

        if new_size > size {
            let (fid, file) = self.allocator.allocate()?;
            txc.note_allocated_fid();
            file.set_len(new_size - size).map_err(Error::from_io)?;
            txc.sync_fd(file);
            state.record.data_map.push(FragmentExtent {
                logical_offset: size,
                length: new_size - size,
                fid,
            });
        } else if new_size < size {
            let mut kept = Vec::with_capacity(state.record.data_map.len());
            let mut ops = Vec::new();
            for extent in &state.record.data_map {
                if extent.end() <= new_size {
                    kept.push(*extent);
                } else if extent.logical_offset >= new_size {
                    txc.remove_fid(extent.fid);
                } else {
                    let keep = new_size - extent.logical_offset;
                    ops.push(WalOp::Truncate {
                        fid: extent.fid,
                        length: keep,
                    });
                    kept.push(FragmentExtent {
                        logical_offset: extent.logical_offset,
                        length: keep,
                        fid: extent.fid,
                    });
                }
            }
            state.record.data_map = kept;
            if !ops.is_empty() {
                txc.push_wal_ops(&self.wal_seq, ops);
            }
        }
        state.record.size = new_size;
        state.dirty = true;
        drop(state);
        txc.write_onode(&o);
        Ok(())
    }

    fn do_remove(&self, txc: &TransContext, c: &CollectionRef, oid: &Oid) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        {
            let mut state = o.lock();
            for extent in &state.record.data_map {
                txc.remove_fid(extent.fid);
            }
            state.record = Default::default();
            state.exists = false;
            state.dirty = true;
        }
        txc.write_onode(&o);

        // committed omap rows go with the object
        let (start, end) = keys::omap_full_range(&o.key);
        for (k, _) in self.db.scan(Prefix::Omap, &start, Some(&end))? {
            txc.batch().remove(Prefix::Omap, k);
        }
        Ok(())
    }

    fn do_setattrs(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        attrs: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        let mut state = o.lock();
        state.record.attrs.extend(attrs);
        state.dirty = true;
        drop(state);
        txc.write_onode(&o);
        Ok(())
    }

    fn do_rmattr(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        name: &str,
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        let mut state = o.lock();
        if state.record.attrs.remove(name).is_none() {
            return Err(Error::NoData(format!("attr {:?} on {}", name, oid)));
        }
        state.dirty = true;
        drop(state);
        txc.write_onode(&o);
        Ok(())
    }

    fn do_rmattrs(&self, txc: &TransContext, c: &CollectionRef, oid: &Oid) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        let mut state = o.lock();
        state.record.attrs.clear();
        state.dirty = true;
        drop(state);
        txc.write_onode(&o);
        Ok(())
    }

    /// Read `[offset, offset+length)` of `state`, overlaying wal ops this
    /// submission already staged against the covering fragments. Committed
    /// wal from earlier submissions must be waited out by the caller.
    fn read_with_staged_wal(
        &self,
        state: &crate::onode::OnodeState,
        txc: &TransContext,
        offset: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        let mut buf = self.read_extents(&state.record, offset, end)?;
        let Some(staged) = txc.wal_txn() else {
            return Ok(buf);
        };
        for op in &staged.ops {
            let (fid, file_off, data, zero_len) = match op {
                WalOp::Write { fid, offset, data } => (*fid, *offset, Some(data), 0),
                WalOp::Zero {
                    fid,
                    offset,
                    length,
                } => (*fid, *offset, None, *length),
                // truncates already shortened the staged data map
                WalOp::Truncate { .. } => continue,
            };
            let op_len = data.map_or(zero_len, |d| d.len() as u64);
            for extent in &state.record.data_map {
                if extent.fid != fid {
                    continue;
                }
                let logical = extent.logical_offset + file_off;
                let seg_start = logical.max(offset);
                let seg_end = (logical + op_len).min(end).min(extent.end());
                if seg_start >= seg_end {
                    continue;
                }
                let buf_from = (seg_start - offset) as usize;
                let len = (seg_end - seg_start) as usize;
                match data {
                    Some(d) => {
                        let from = (seg_start - logical) as usize;
                        buf[buf_from..buf_from + len].copy_from_slice(&d[from..from + len]);
                    }
                    None => buf[buf_from..buf_from + len].fill(0),
                }
            }
        }
        Ok(buf)
    }

    fn do_clone(&self, txc: &TransContext, c: &CollectionRef, src: &Oid, dst: &Oid) -> Result<()> {
        let src_o = self.get_onode(c, src, false)?;
        src_o.wait_unapplied();
        let (data, attrs) = {
            let state = src_o.lock();
            let data = self.read_with_staged_wal(&state, txc, 0, state.record.size)?;
            (data, state.record.attrs.clone())
        };

        let dst_o = self.get_onode(c, dst, true)?;
        {
            let mut state = dst_o.lock();
            for extent in &state.record.data_map {
                txc.remove_fid(extent.fid);
            }
            state.record.data_map.clear();
            state.record.size = 0;
            state.record.attrs = attrs;
            if !data.is_empty() {
                let (fid, file) = self.allocator.allocate()?;
                txc.note_allocated_fid();
                file.write_all_at(&data, 0).map_err(Error::from_io)?;
                txc.sync_fd(file);
                state.record.data_map.push(FragmentExtent {
                    logical_offset: 0,
                    length: data.len() as u64,
                    fid,
                });
                state.record.size = data.len() as u64;
            }
            state.dirty = true;
        }
        txc.write_onode(&dst_o);

        // replace dst's committed omap with src's
        let (dstart, dend) = keys::omap_full_range(&dst_o.key);
        for (k, _) in self.db.scan(Prefix::Omap, &dstart, Some(&dend))? {
            txc.batch().remove(Prefix::Omap, k);
        }
        let (sstart, send) = keys::omap_full_range(&src_o.key);
        for (k, v) in self.db.scan(Prefix::Omap, &sstart, Some(&send))? {
            let mut new_key = dst_o.key.clone();
            new_key.extend_from_slice(&k[src_o.key.len()..]);
            txc.batch().set(Prefix::Omap, new_key, v);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn do_clone_range(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        src: &Oid,
        dst: &Oid,
        src_offset: u64,
        length: u64,
        dst_offset: u64,
    ) -> Result<()> {
        let src_o = self.get_onode(c, src, false)?;
        src_o.wait_unapplied();
        let data = {
            let state = src_o.lock();
            let size = state.record.size;
            if src_offset >= size {
                Vec::new()
            } else {
                let end = size.min(src_offset + length);
                self.read_with_staged_wal(&state, txc, src_offset, end)?
            }
        };
        if data.is_empty() {
            // still materialize the destination
            return self.do_touch(txc, c, dst);
        }
        self.do_write(txc, c, dst, dst_offset, &data)
    }

    fn do_mkcoll(&self, txc: &TransContext, cid: &CollectionId) -> Result<()> {
        let mut colls = self.colls.write();
        if colls.contains_key(cid) || self.db.get(Prefix::Coll, cid.as_str().as_bytes())?.is_some()
        {
            return Err(Error::AlreadyExists(format!("collection {}", cid)));
        }
        txc.batch()
            .set(Prefix::Coll, cid.as_str().as_bytes().to_vec(), Vec::new());
        colls.insert(cid.clone(), Collection::new(cid.clone()));
        Ok(())
    }

    fn do_rmcoll(&self, txc: &TransContext, cid: &CollectionId) -> Result<()> {
        let mut colls = self.colls.write();
        if !colls.contains_key(cid) && self.db.get(Prefix::Coll, cid.as_str().as_bytes())?.is_none()
        {
            return Err(Error::NotFound(format!("collection {}", cid)));
        }

        // emptiness is decided by the kv store, not the cache
        let (start, end) = keys::collection_range(cid);
        if !self.db.scan(Prefix::Obj, &start, Some(&end))?.is_empty() {
            return Err(Error::NotEmpty(format!("collection {}", cid)));
        }
        // objects created earlier in this same submission are not yet in kv
        for o in txc.onodes() {
            if o.key.starts_with(&start) && o.lock().exists {
                return Err(Error::NotEmpty(format!("collection {}", cid)));
            }
        }

        txc.batch()
            .remove(Prefix::Coll, cid.as_str().as_bytes().to_vec());
        colls.remove(cid);
        Ok(())
    }

    fn do_coll_move_rename(
        &self,
        txc: &TransContext,
        src_cid: &CollectionId,
        src_oid: &Oid,
        dst_cid: &CollectionId,
        dst_oid: &Oid,
    ) -> Result<()> {
        let src_c = self.resolve_collection(src_cid)?;
        let dst_c = self.resolve_collection(dst_cid)?;
        let src_o = self.get_onode(&src_c, src_oid, false)?;
        src_o.wait_unapplied();

        if let Some(existing) = dst_c.cache.get(&self.db, dst_oid, false)? {
            if existing.lock().exists {
                return Err(Error::AlreadyExists(format!("{}/{}", dst_cid, dst_oid)));
            }
        }

        // fragment files are store-global, so the move is pure metadata
        let record = {
            let mut state = src_o.lock();
            let record = std::mem::take(&mut state.record);
            state.exists = false;
            state.dirty = true;
            record
        };
        txc.write_onode(&src_o);

        let dst_key = keys::object_key(dst_cid, dst_oid);
        let dst_o = Onode::new(dst_oid.clone(), dst_key, record, true, true);
        dst_c.cache.insert_live(&dst_o);
        txc.write_onode(&dst_o);

        // omap rows move with the object
        let (start, end) = keys::omap_full_range(&src_o.key);
        for (k, v) in self.db.scan(Prefix::Omap, &start, Some(&end))? {
            let mut new_key = dst_o.key.clone();
            new_key.extend_from_slice(&k[src_o.key.len()..]);
            txc.batch().remove(Prefix::Omap, k);
            txc.batch().set(Prefix::Omap, new_key, v);
        }
        Ok(())
    }

    fn do_omap_clear(&self, txc: &TransContext, c: &CollectionRef, oid: &Oid) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        let (start, end) = keys::omap_full_range(&o.key);
        for (k, _) in self.db.scan(Prefix::Omap, &start, Some(&end))? {
            txc.batch().remove(Prefix::Omap, k);
        }
        Ok(())
    }

    fn do_omap_setkeys(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        entries: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        for (k, v) in entries {
            if k.is_empty() {
                return Err(Error::InvalidArgument(
                    "omap keys must not be empty".to_string(),
                ));
            }
            let mut row_key = o.key.clone();
            row_key.extend_from_slice(k);
            txc.batch().set(Prefix::Omap, row_key, v.clone());
        }
        Ok(())
    }

    fn do_omap_rmkeys(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        keys_to_remove: &[Vec<u8>],
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        for k in keys_to_remove {
            let mut row_key = o.key.clone();
            row_key.extend_from_slice(k);
            txc.batch().remove(Prefix::Omap, row_key);
        }
        Ok(())
    }

    fn do_omap_rmkeyrange(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        first: &[u8],
        last: &[u8],
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        let mut start = o.key.clone();
        start.extend_from_slice(first);
        let mut end = o.key.clone();
        end.extend_from_slice(last);
        for (k, _) in self.db.scan(Prefix::Omap, &start, Some(&end))? {
            txc.batch().remove(Prefix::Omap, k);
        }
        Ok(())
    }

    fn do_omap_setheader(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        header: &[u8],
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        txc.batch()
            .set(Prefix::Omap, o.key.clone(), header.to_vec());
        Ok(())
    }

    fn do_split_collection(
        &self,
        txc: &TransContext,
        cid: &CollectionId,
        bits: u32,
        rem: u32,
        dest: &CollectionId,
    ) -> Result<()> {
        let src_c = self.resolve_collection(cid)?;
        self.resolve_collection(dest)?;
        let mask = if bits >= 32 {
            u32::MAX
        } else {
            (1u32 << bits) - 1
        };

        let (start, end) = keys::collection_range(cid);
        for (key, value) in self.db.scan(Prefix::Obj, &start, Some(&end))? {
            let (_, oid) = keys::decode_object_key(&key)?;
            if oid.hash & mask != rem & mask {
                continue;
            }
            let new_key = keys::object_key(dest, &oid);
            txc.batch().remove(Prefix::Obj, key.clone());
            txc.batch().set(Prefix::Obj, new_key.clone(), value);
            src_c.cache.remove(&oid);

            let (ostart, oend) = keys::omap_full_range(&key);
            for (mk, mv) in self.db.scan(Prefix::Omap, &ostart, Some(&oend))? {
                let mut moved = new_key.clone();
                moved.extend_from_slice(&mk[key.len()..]);
                txc.batch().remove(Prefix::Omap, mk);
                txc.batch().set(Prefix::Omap, moved, mv);
            }
        }
        Ok(())
    }

    fn do_coll_hint(&self, cid: &CollectionId, code: u32, payload: &[u8]) -> Result<()> {
        let c = self.resolve_collection(cid)?;
        if code == COLL_HINT_EXPECTED_OBJECTS {
            match bincode::deserialize::<(u64, u64)>(payload) {
                Ok(hint) => *c.hint.lock() = Some(hint),
                Err(e) => debug!(%cid, error = %e, "ignoring malformed collection hint"),
            }
        } else {
            debug!(%cid, code, "ignoring unknown collection hint");
        }
        Ok(())
    }

    fn do_set_alloc_hint(
        &self,
        txc: &TransContext,
        c: &CollectionRef,
        oid: &Oid,
        expected_object_size: u64,
        expected_write_size: u64,
    ) -> Result<()> {
        let o = self.get_onode(c, oid, false)?;
        let mut state = o.lock();
        state.record.alloc_hint = Some(fragstore_core::AllocHint {
            expected_object_size,
            expected_write_size,
        });
        state.dirty = true;
        drop(state);
        txc.write_onode(&o);
        Ok(())
    }

    /// The commit pipeline: stage dirty onodes and the wal row into the kv
    /// batch, fsync fresh fragment files, commit atomically, unlink removed
    /// fragments, dispatch callbacks, and hand wal work to the applier.
    fn finalize_and_commit(
        &self,
        txc: &Arc<TransContext>,
        on_readable: Option<Callback>,
        on_commit: Option<Callback>,
    ) -> Result<()> {
        for o in txc.onodes() {
            let mut state = o.lock();
            if state.exists {
                let bytes = bincode::serialize(&state.record)?;
                txc.batch().set(Prefix::Obj, o.key.clone(), bytes);
            } else {
                txc.batch().remove(Prefix::Obj, o.key.clone());
            }
            state.dirty = false;
        }

        let staged_wal = txc.wal_txn();
        if let Some(w) = &staged_wal {
            txc.batch()
                .set(Prefix::Wal, keys::wal_seq_key(w.seq), w.encode()?);
        }

        if txc.allocated_fids() {
            let sb = {
                let mut sb = self.superblock.lock();
                sb.fid_watermark = self.allocator.current();
                sb.clone()
            };
            txc.batch()
                .set(Prefix::Super, super::SUPERBLOCK_KEY, bincode::serialize(&sb)?);
        }

        // data must be durable before the kv batch that references it
        for file in txc.take_fds_to_sync() {
            file.sync_data().map_err(Error::from_io)?;
        }

        // synchronous readability: the staged state is visible now
        if let Some(cb) = on_readable {
            self.finisher.queue(cb);
        }

        self.db.commit(txc.take_batch())?;

        for fid in txc.take_fids_to_remove() {
            if let Err(e) = self.allocator.remove_fid(fid) {
                warn!(%fid, error = %e, "failed to unlink fragment after commit");
            }
        }

        if let Some(cb) = on_commit {
            self.finisher.queue(cb);
        }
        for cb in txc.mark_committed() {
            self.finisher.queue(cb);
        }

        if staged_wal.is_some() {
            txc.start_wal_apply();
            if self.config.defer_wal_apply {
                debug!("wal apply deferred by configuration");
            } else {
                let db = Arc::clone(&self.db);
                let allocator = Arc::clone(&self.allocator);
                let txc = Arc::clone(txc);
                self.wal_applier.queue(move || {
                    if let Some(w) = txc.wal_txn() {
                        wal::apply_in_background(db.as_ref(), &allocator, &w);
                    }
                    txc.finish_wal_apply();
                });
            }
        }
        Ok(())
    }
}
