//! Transaction description
//!
//! A [`Transaction`] is an ordered list of opcodes built through the fluent
//! methods below. On the wire it is an opaque bincode stream; the engine
//! decodes it back with [`Transaction::decode`], where any unknown tag
//! surfaces as `InvalidArgument` before anything is staged.
//!
//! All opcodes are staged: no mutation reaches disk until the enclosing
//! submission commits.

use fragstore_core::{CollectionId, Error, Oid, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Completion callback invoked by the finisher thread
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Collection hint: expected object count and total byte size,
/// bincode-encoded `(u64, u64)` payload.
pub const COLL_HINT_EXPECTED_OBJECTS: u32 = 1;

/// One opcode of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// No effect
    Nop,
    /// Materialize the object
    Touch { cid: CollectionId, oid: Oid },
    /// Write bytes at an offset (append, overwrite, or sparse)
    Write {
        cid: CollectionId,
        oid: Oid,
        offset: u64,
        data: Vec<u8>,
        flags: u32,
    },
    /// Logically zero a byte range
    Zero {
        cid: CollectionId,
        oid: Oid,
        offset: u64,
        length: u64,
    },
    /// Adjust the object length
    Truncate {
        cid: CollectionId,
        oid: Oid,
        size: u64,
    },
    /// Delete the object and queue its fragments for removal
    Remove { cid: CollectionId, oid: Oid },
    /// Set one attribute
    SetAttr {
        cid: CollectionId,
        oid: Oid,
        name: String,
        value: Vec<u8>,
    },
    /// Merge a set of attributes
    SetAttrs {
        cid: CollectionId,
        oid: Oid,
        attrs: BTreeMap<String, Vec<u8>>,
    },
    /// Remove one attribute
    RmAttr {
        cid: CollectionId,
        oid: Oid,
        name: String,
    },
    /// Remove all attributes
    RmAttrs { cid: CollectionId, oid: Oid },
    /// Copy object data, attrs, and omap from `src` onto `dst`
    Clone {
        cid: CollectionId,
        src: Oid,
        dst: Oid,
    },
    /// Copy a byte range from `src` into a possibly-existing `dst`
    CloneRange {
        cid: CollectionId,
        src: Oid,
        dst: Oid,
        src_offset: u64,
        length: u64,
        dst_offset: u64,
    },
    /// Create a collection
    MkColl { cid: CollectionId },
    /// Destroy an empty collection
    RmColl { cid: CollectionId },
    /// Move an object between collections, renaming it
    CollMoveRename {
        src_cid: CollectionId,
        src_oid: Oid,
        dst_cid: CollectionId,
        dst_oid: Oid,
    },
    /// Remove the omap header and every omap entry
    OmapClear { cid: CollectionId, oid: Oid },
    /// Insert or overwrite omap entries
    OmapSetKeys {
        cid: CollectionId,
        oid: Oid,
        entries: BTreeMap<Vec<u8>, Vec<u8>>,
    },
    /// Remove specific omap entries
    OmapRmKeys {
        cid: CollectionId,
        oid: Oid,
        keys: Vec<Vec<u8>>,
    },
    /// Remove omap entries in `[first, last)`
    OmapRmKeyRange {
        cid: CollectionId,
        oid: Oid,
        first: Vec<u8>,
        last: Vec<u8>,
    },
    /// Set the omap header blob
    OmapSetHeader {
        cid: CollectionId,
        oid: Oid,
        header: Vec<u8>,
    },
    /// Move objects whose low `bits` of hash equal `rem` into `dest`
    SplitCollection {
        cid: CollectionId,
        bits: u32,
        rem: u32,
        dest: CollectionId,
    },
    /// Advisory collection hint; unknown codes are ignored
    CollHint {
        cid: CollectionId,
        code: u32,
        payload: Vec<u8>,
    },
    /// Record an allocation hint on the object
    SetAllocHint {
        cid: CollectionId,
        oid: Oid,
        expected_object_size: u64,
        expected_write_size: u64,
    },
}

/// An ordered, atomically-committed batch of opcodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    /// Create an empty transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// The opcodes in declaration order
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Whether the transaction stages nothing
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Serialize into the opaque submission stream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a submission stream; malformed input (including unknown
    /// opcode tags) is rejected before anything is staged.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::InvalidArgument(format!("undecodable transaction: {}", e)))
    }

    pub fn nop(&mut self) -> &mut Self {
        self.ops.push(Op::Nop);
        self
    }

    pub fn touch(&mut self, cid: impl Into<CollectionId>, oid: Oid) -> &mut Self {
        self.ops.push(Op::Touch {
            cid: cid.into(),
            oid,
        });
        self
    }

    pub fn write(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        offset: u64,
        data: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::Write {
            cid: cid.into(),
            oid,
            offset,
            data: data.into(),
            flags: 0,
        });
        self
    }

    pub fn zero(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        offset: u64,
        length: u64,
    ) -> &mut Self {
        self.ops.push(Op::Zero {
            cid: cid.into(),
            oid,
            offset,
            length,
        });
        self
    }

    pub fn truncate(&mut self, cid: impl Into<CollectionId>, oid: Oid, size: u64) -> &mut Self {
        self.ops.push(Op::Truncate {
            cid: cid.into(),
            oid,
            size,
        });
        self
    }

    pub fn remove(&mut self, cid: impl Into<CollectionId>, oid: Oid) -> &mut Self {
        self.ops.push(Op::Remove {
            cid: cid.into(),
            oid,
        });
        self
    }

    pub fn setattr(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        name: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::SetAttr {
            cid: cid.into(),
            oid,
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn setattrs(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        attrs: BTreeMap<String, Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::SetAttrs {
            cid: cid.into(),
            oid,
            attrs,
        });
        self
    }

    pub fn rmattr(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        name: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(Op::RmAttr {
            cid: cid.into(),
            oid,
            name: name.into(),
        });
        self
    }

    pub fn rmattrs(&mut self, cid: impl Into<CollectionId>, oid: Oid) -> &mut Self {
        self.ops.push(Op::RmAttrs {
            cid: cid.into(),
            oid,
        });
        self
    }

    pub fn clone_object(&mut self, cid: impl Into<CollectionId>, src: Oid, dst: Oid) -> &mut Self {
        self.ops.push(Op::Clone {
            cid: cid.into(),
            src,
            dst,
        });
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn clone_range(
        &mut self,
        cid: impl Into<CollectionId>,
        src: Oid,
        dst: Oid,
        src_offset: u64,
        length: u64,
        dst_offset: u64,
    ) -> &mut Self {
        self.ops.push(Op::CloneRange {
            cid: cid.into(),
            src,
            dst,
            src_offset,
            length,
            dst_offset,
        });
        self
    }

    pub fn create_collection(&mut self, cid: impl Into<CollectionId>) -> &mut Self {
        self.ops.push(Op::MkColl { cid: cid.into() });
        self
    }

    pub fn remove_collection(&mut self, cid: impl Into<CollectionId>) -> &mut Self {
        self.ops.push(Op::RmColl { cid: cid.into() });
        self
    }

    pub fn collection_move_rename(
        &mut self,
        src_cid: impl Into<CollectionId>,
        src_oid: Oid,
        dst_cid: impl Into<CollectionId>,
        dst_oid: Oid,
    ) -> &mut Self {
        self.ops.push(Op::CollMoveRename {
            src_cid: src_cid.into(),
            src_oid,
            dst_cid: dst_cid.into(),
            dst_oid,
        });
        self
    }

    pub fn omap_clear(&mut self, cid: impl Into<CollectionId>, oid: Oid) -> &mut Self {
        self.ops.push(Op::OmapClear {
            cid: cid.into(),
            oid,
        });
        self
    }

    pub fn omap_setkeys(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        entries: BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::OmapSetKeys {
            cid: cid.into(),
            oid,
            entries,
        });
        self
    }

    pub fn omap_rmkeys(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        keys: Vec<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::OmapRmKeys {
            cid: cid.into(),
            oid,
            keys,
        });
        self
    }

    pub fn omap_rmkeyrange(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        first: impl Into<Vec<u8>>,
        last: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::OmapRmKeyRange {
            cid: cid.into(),
            oid,
            first: first.into(),
            last: last.into(),
        });
        self
    }

    pub fn omap_setheader(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        header: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::OmapSetHeader {
            cid: cid.into(),
            oid,
            header: header.into(),
        });
        self
    }

    pub fn split_collection(
        &mut self,
        cid: impl Into<CollectionId>,
        bits: u32,
        rem: u32,
        dest: impl Into<CollectionId>,
    ) -> &mut Self {
        self.ops.push(Op::SplitCollection {
            cid: cid.into(),
            bits,
            rem,
            dest: dest.into(),
        });
        self
    }

    pub fn collection_hint(
        &mut self,
        cid: impl Into<CollectionId>,
        code: u32,
        payload: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(Op::CollHint {
            cid: cid.into(),
            code,
            payload: payload.into(),
        });
        self
    }

    pub fn set_alloc_hint(
        &mut self,
        cid: impl Into<CollectionId>,
        oid: Oid,
        expected_object_size: u64,
        expected_write_size: u64,
    ) -> &mut Self {
        self.ops.push(Op::SetAllocHint {
            cid: cid.into(),
            oid,
            expected_object_size,
            expected_write_size,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_declaration_order() {
        let mut t = Transaction::new();
        t.create_collection("c0")
            .touch("c0", Oid::head("a"))
            .write("c0", Oid::head("a"), 0, b"ping".to_vec());
        assert_eq!(t.ops().len(), 3);
        assert!(matches!(t.ops()[0], Op::MkColl { .. }));
        assert!(matches!(t.ops()[2], Op::Write { .. }));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut t = Transaction::new();
        t.touch("c0", Oid::head("a"))
            .zero("c0", Oid::head("a"), 4, 8)
            .setattr("c0", Oid::head("a"), "_", b"v".to_vec());
        let bytes = t.encode().unwrap();
        let back = Transaction::decode(&bytes).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_decode_garbage_is_invalid_argument() {
        let err = Transaction::decode(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_decode_unknown_tag_is_invalid_argument() {
        // a valid stream whose op tag is far beyond the enum
        let mut bytes = Transaction::new().encode().unwrap();
        // one op follows
        bytes[0..8].copy_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = Transaction::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
