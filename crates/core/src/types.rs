//! Identifiers and persisted records
//!
//! - `CollectionId`: opaque namespace id for a set of objects
//! - `Oid`: hierarchical object identifier
//! - `Fid`: fragment file identifier, `(fset, fno)`
//! - `OnodeRecord`: the per-object metadata value stored in the kv store
//! - `Superblock`: store-wide record written at format time

use crate::keys;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Current superblock format version
pub const SUPERBLOCK_VERSION: u32 = 1;

/// Opaque collection identifier
///
/// A collection names a disjoint oid space with its own onode cache. The
/// id doubles as the kv row key under the collection prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    /// Create a collection id from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Snapshot coordinate of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapId {
    /// The live object
    Head,
    /// The snapshot directory object
    SnapDir,
    /// A specific snapshot
    Snap(u64),
}

/// Hierarchical object identifier
///
/// Ordering is defined as byte order of the canonical key encoding (see
/// [`keys::oid_key`]), which sorts by shard, then hash, then the remaining
/// fields. `Ord` is implemented against that encoding so that kv iteration
/// order and in-memory order always agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Oid {
    /// Placement shard
    pub shard: u8,
    /// Placement hash
    pub hash: u32,
    /// Pool the object belongs to
    pub pool: i64,
    /// Object namespace (may be empty)
    pub namespace: String,
    /// Locator key (may be empty)
    pub key: String,
    /// Object name
    pub name: String,
    /// Snapshot coordinate
    pub snap: SnapId,
    /// Rollback generation, when set
    pub generation: Option<u64>,
}

impl Oid {
    /// A head object with the given name and defaults everywhere else.
    pub fn head(name: impl Into<String>) -> Self {
        Self {
            shard: 0,
            hash: 0,
            pool: 0,
            namespace: String::new(),
            key: String::new(),
            name: name.into(),
            snap: SnapId::Head,
            generation: None,
        }
    }
}

impl PartialOrd for Oid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Oid {
    fn cmp(&self, other: &Self) -> Ordering {
        keys::oid_key(self).cmp(&keys::oid_key(other))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}:{}", self.pool, self.hash, self.name)?;
        match self.snap {
            SnapId::Head => Ok(()),
            SnapId::SnapDir => write!(f, "@snapdir"),
            SnapId::Snap(s) => write!(f, "@{:x}", s),
        }
    }
}

/// Fragment file identifier: bucket directory (`fset`) and file (`fno`)
///
/// Both components are monotonic; derived `Ord` (fset, then fno) matches
/// issuance order, so "strictly greater than every fid ever issued" is a
/// plain comparison.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Fid {
    /// Bucket directory under `fragments/`
    pub fset: u64,
    /// File inside the bucket
    pub fno: u64,
}

impl Fid {
    /// Construct a fid
    pub fn new(fset: u64, fno: u64) -> Self {
        Self { fset, fno }
    }

    /// The zero fid, used as the "nothing issued yet" watermark.
    pub fn none() -> Self {
        Self::default()
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fset, self.fno)
    }
}

/// One entry of an onode's data map
///
/// The fragment file's byte `i` holds the object's logical byte
/// `logical_offset + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentExtent {
    /// Logical offset within the object
    pub logical_offset: u64,
    /// Length of the fragment in bytes
    pub length: u64,
    /// Backing fragment file
    pub fid: Fid,
}

impl FragmentExtent {
    /// Logical end offset (exclusive)
    pub fn end(&self) -> u64 {
        self.logical_offset + self.length
    }
}

/// Allocation hint recorded on an onode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocHint {
    /// Expected final object size
    pub expected_object_size: u64,
    /// Expected write granularity
    pub expected_write_size: u64,
}

/// Persisted per-object metadata, stored as the value of the object's kv row
///
/// Existence is encoded by row presence: a removed object simply has no row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnodeRecord {
    /// Logical object length in bytes
    pub size: u64,
    /// Attribute name to opaque bytes
    pub attrs: BTreeMap<String, Vec<u8>>,
    /// Non-overlapping fragments in ascending logical order
    pub data_map: Vec<FragmentExtent>,
    /// Allocation hint, if one was recorded
    pub alloc_hint: Option<AllocHint>,
}

/// Store-wide record written at mkfs under the superblock prefix
///
/// `fid_watermark` is re-staged inside every kv batch that allocated fids,
/// so fid monotonicity survives a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Superblock {
    /// Format version
    pub version: u32,
    /// Instance identifier, matching the fsid file
    pub fsid: Uuid,
    /// Highest fid issued so far
    pub fid_watermark: Fid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fid_ordering_matches_issuance() {
        assert!(Fid::new(1, 2) < Fid::new(1, 3));
        assert!(Fid::new(1, 999) < Fid::new(2, 1));
        assert!(Fid::none() < Fid::new(1, 1));
    }

    #[test]
    fn test_oid_ordering_shard_then_hash() {
        let mut a = Oid::head("zzz");
        a.hash = 1;
        let mut b = Oid::head("aaa");
        b.hash = 2;
        // hash dominates name
        assert!(a < b);

        let mut c = Oid::head("x");
        c.shard = 1;
        // shard dominates hash
        assert!(b < c);
    }

    #[test]
    fn test_extent_end() {
        let e = FragmentExtent {
            logical_offset: 8,
            length: 4,
            fid: Fid::new(1, 1),
        };
        assert_eq!(e.end(), 12);
    }

    #[test]
    fn test_onode_record_roundtrip() {
        let mut rec = OnodeRecord {
            size: 12,
            ..Default::default()
        };
        rec.attrs.insert("_".to_string(), b"v".to_vec());
        rec.data_map.push(FragmentExtent {
            logical_offset: 0,
            length: 12,
            fid: Fid::new(1, 1),
        });
        let bytes = bincode::serialize(&rec).unwrap();
        let back: OnodeRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock {
            version: SUPERBLOCK_VERSION,
            fsid: Uuid::new_v4(),
            fid_watermark: Fid::new(3, 17),
        };
        let bytes = bincode::serialize(&sb).unwrap();
        let back: Superblock = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, sb);
    }
}
