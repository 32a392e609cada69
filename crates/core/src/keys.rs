//! Canonical key codec for the kv store
//!
//! Object rows are keyed by an order-preserving string encoding of
//! `(collection, oid)`. The encoding is prefix-free (terminated by `0xff`,
//! a byte that cannot appear in UTF-8 field data) and sorts byte-wise in
//! canonical oid order: shard, then hash, then the remaining fields.
//!
//! Layout of one oid key:
//!
//! ```text
//! <shard:2 hex> ! <hash:8 hex> ! <esc namespace> ! <pool:decimal> !
//! <esc key> ! <esc name> ! <"head"|"snapdir"|snap:16 hex>
//! [ ! <generation:16 hex> ! <shard:hex> ]   ; only when generation is set
//! 0xff
//! ```
//!
//! Escape rule inside variable fields: `%` → `%p`, `.` → `%e`, `!` → `%u`.
//! Decode additionally accepts `%s` for `!`. Fixed-width hex keeps the
//! byte-lexicographic order equal to numeric order.

use crate::error::{Error, Result};
use crate::types::{CollectionId, Oid, SnapId};

/// Field separator inside encoded keys
pub const KEY_SEP: u8 = b'!';
/// Key terminator; never appears in UTF-8 field data
pub const KEY_END: u8 = 0xff;

fn escape_into(out: &mut Vec<u8>, field: &str) {
    for &b in field.as_bytes() {
        match b {
            b'%' => out.extend_from_slice(b"%p"),
            b'.' => out.extend_from_slice(b"%e"),
            KEY_SEP => out.extend_from_slice(b"%u"),
            _ => out.push(b),
        }
    }
}

fn unescape(token: &[u8]) -> Result<String> {
    let mut out = Vec::with_capacity(token.len());
    let mut it = token.iter();
    while let Some(&b) = it.next() {
        if b == b'%' {
            match it.next() {
                Some(b'p') => out.push(b'%'),
                Some(b'e') => out.push(b'.'),
                Some(b'u') | Some(b's') => out.push(KEY_SEP),
                other => {
                    return Err(Error::Corrupt(format!(
                        "bad escape sequence %{:?} in key",
                        other
                    )))
                }
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).map_err(|e| Error::Corrupt(format!("non-utf8 key field: {}", e)))
}

/// Encode one oid, without collection scoping.
pub fn oid_key(oid: &Oid) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(format!("{:02x}", oid.shard).as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(format!("{:08x}", oid.hash).as_bytes());
    key.push(KEY_SEP);
    escape_into(&mut key, &oid.namespace);
    key.push(KEY_SEP);
    key.extend_from_slice(oid.pool.to_string().as_bytes());
    key.push(KEY_SEP);
    escape_into(&mut key, &oid.key);
    key.push(KEY_SEP);
    escape_into(&mut key, &oid.name);
    key.push(KEY_SEP);
    match oid.snap {
        SnapId::Head => key.extend_from_slice(b"head"),
        SnapId::SnapDir => key.extend_from_slice(b"snapdir"),
        SnapId::Snap(s) => key.extend_from_slice(format!("{:016x}", s).as_bytes()),
    }
    if let Some(generation) = oid.generation {
        key.push(KEY_SEP);
        key.extend_from_slice(format!("{:016x}", generation).as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(format!("{:x}", oid.shard).as_bytes());
    }
    key.push(KEY_END);
    key
}

/// Encode the kv row key of an object: `esc(cid) ! <oid key>`.
///
/// Collection scoping makes the oid spaces of two collections disjoint and
/// gives each collection a contiguous, scannable key range.
pub fn object_key(cid: &CollectionId, oid: &Oid) -> Vec<u8> {
    let mut key = Vec::with_capacity(80);
    escape_into(&mut key, cid.as_str());
    key.push(KEY_SEP);
    key.extend_from_slice(&oid_key(oid));
    key
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Token up to (excluding) the first of `stops`; does not consume the stop.
    fn token(&mut self, stops: &[u8]) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.buf.len() {
            if stops.contains(&self.buf[self.pos]) {
                return Ok(&self.buf[start..self.pos]);
            }
            self.pos += 1;
        }
        Err(Error::Corrupt("truncated object key".to_string()))
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::Corrupt(format!(
                "malformed object key at byte {}",
                self.pos
            )))
        }
    }
}

fn parse_hex(token: &[u8], what: &str) -> Result<u64> {
    let s = std::str::from_utf8(token)
        .map_err(|_| Error::Corrupt(format!("non-utf8 {} field", what)))?;
    u64::from_str_radix(s, 16).map_err(|_| Error::Corrupt(format!("bad hex {} field", what)))
}

fn decode_oid(cur: &mut Cursor<'_>) -> Result<Oid> {
    let shard = parse_hex(cur.token(&[KEY_SEP])?, "shard")? as u8;
    cur.expect(KEY_SEP)?;
    let hash = parse_hex(cur.token(&[KEY_SEP])?, "hash")? as u32;
    cur.expect(KEY_SEP)?;
    let namespace = unescape(cur.token(&[KEY_SEP])?)?;
    cur.expect(KEY_SEP)?;
    let pool_tok = cur.token(&[KEY_SEP])?;
    let pool = std::str::from_utf8(pool_tok)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Corrupt("bad pool field".to_string()))?;
    cur.expect(KEY_SEP)?;
    let key = unescape(cur.token(&[KEY_SEP])?)?;
    cur.expect(KEY_SEP)?;
    let name = unescape(cur.token(&[KEY_SEP])?)?;
    cur.expect(KEY_SEP)?;

    let snap_tok = cur.token(&[KEY_SEP, KEY_END])?;
    let snap = match snap_tok {
        b"head" => SnapId::Head,
        b"snapdir" => SnapId::SnapDir,
        t => SnapId::Snap(parse_hex(t, "snap")?),
    };

    let generation = if cur.peek() == Some(KEY_SEP) {
        cur.expect(KEY_SEP)?;
        let generation = parse_hex(cur.token(&[KEY_SEP])?, "generation")?;
        cur.expect(KEY_SEP)?;
        let shard_again = parse_hex(cur.token(&[KEY_END])?, "generation shard")? as u8;
        if shard_again != shard {
            return Err(Error::Corrupt(
                "generation shard disagrees with leading shard".to_string(),
            ));
        }
        Some(generation)
    } else {
        None
    };
    cur.expect(KEY_END)?;

    Ok(Oid {
        shard,
        hash,
        pool,
        namespace,
        key,
        name,
        snap,
        generation,
    })
}

/// Decode an object row key back into `(collection, oid)`.
pub fn decode_object_key(key: &[u8]) -> Result<(CollectionId, Oid)> {
    let mut cur = Cursor::new(key);
    let cid = unescape(cur.token(&[KEY_SEP])?)?;
    cur.expect(KEY_SEP)?;
    let oid = decode_oid(&mut cur)?;
    Ok((CollectionId::new(cid), oid))
}

/// The smallest key strictly greater than every key starting with `prefix`.
///
/// Empty result means "no upper bound" (the prefix was all `0xff`).
pub fn prefix_successor(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xff {
            *last += 1;
            return out;
        }
        out.pop();
    }
    out
}

/// Scan range covering every object row of one collection.
pub fn collection_range(cid: &CollectionId) -> (Vec<u8>, Vec<u8>) {
    let mut prefix = Vec::with_capacity(cid.as_str().len() + 1);
    escape_into(&mut prefix, cid.as_str());
    prefix.push(KEY_SEP);
    let end = prefix_successor(&prefix);
    (prefix, end)
}

/// Scan range covering an object's omap entries, excluding the header row.
///
/// Entries are keyed `object_key ++ user_key` with non-empty user keys; the
/// header lives at the bare object key and sorts strictly first.
pub fn omap_entry_range(object_key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut start = object_key.to_vec();
    start.push(0x00);
    (start, prefix_successor(object_key))
}

/// Scan range covering an object's omap header and all entries.
pub fn omap_full_range(object_key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (object_key.to_vec(), prefix_successor(object_key))
}

/// Fixed-width wal row key; lexicographic order equals sequence order.
pub fn wal_seq_key(seq: u64) -> Vec<u8> {
    format!("{:016x}", seq).into_bytes()
}

/// Parse a wal row key back into its sequence number.
pub fn parse_wal_seq_key(key: &[u8]) -> Result<u64> {
    parse_hex(key, "wal sequence")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn oid_with(name: &str) -> Oid {
        Oid::head(name)
    }

    #[test]
    fn test_roundtrip_plain() {
        let cid = CollectionId::new("c0");
        let oid = oid_with("rbd_header.1234");
        let key = object_key(&cid, &oid);
        let (cid2, oid2) = decode_object_key(&key).unwrap();
        assert_eq!(cid2, cid);
        assert_eq!(oid2, oid);
    }

    #[test]
    fn test_roundtrip_specials() {
        let cid = CollectionId::new("pg.1!x%y");
        let mut oid = Oid::head("a%b!c.d");
        oid.namespace = "ns!with.sep%".to_string();
        oid.key = "!!%%..".to_string();
        oid.pool = -1;
        oid.hash = 0xdeadbeef;
        oid.shard = 3;
        oid.snap = SnapId::Snap(7);
        oid.generation = Some(42);
        let key = object_key(&cid, &oid);
        let (cid2, oid2) = decode_object_key(&key).unwrap();
        assert_eq!(cid2, cid);
        assert_eq!(oid2, oid);
    }

    #[test]
    fn test_escape_has_no_raw_separator() {
        let mut out = Vec::new();
        escape_into(&mut out, "a!b%c.d");
        assert!(!out.contains(&KEY_SEP));
        assert_eq!(out, b"a%ub%pc%ed".to_vec());
    }

    #[test]
    fn test_decode_accepts_percent_s() {
        // historical alternate escape for the separator
        let cid = CollectionId::new("c");
        let oid = oid_with("x!y");
        let key = object_key(&cid, &oid);
        let alt: Vec<u8> = {
            let mut v = Vec::new();
            let mut i = 0;
            while i < key.len() {
                if key[i] == b'%' && key.get(i + 1) == Some(&b'u') {
                    v.extend_from_slice(b"%s");
                    i += 2;
                } else {
                    v.push(key[i]);
                    i += 1;
                }
            }
            v
        };
        let (_, oid2) = decode_object_key(&alt).unwrap();
        assert_eq!(oid2, oid);
    }

    #[test]
    fn test_hash_dominates_name() {
        let cid = CollectionId::new("c");
        let mut a = oid_with("zzz");
        a.hash = 1;
        let mut b = oid_with("aaa");
        b.hash = 2;
        assert!(object_key(&cid, &a) < object_key(&cid, &b));
    }

    #[test]
    fn test_shard_dominates_hash() {
        let cid = CollectionId::new("c");
        let mut a = oid_with("x");
        a.hash = u32::MAX;
        let mut b = oid_with("x");
        b.shard = 1;
        assert!(object_key(&cid, &a) < object_key(&cid, &b));
    }

    #[test]
    fn test_snap_width_keeps_order() {
        let cid = CollectionId::new("c");
        let mut a = oid_with("x");
        a.snap = SnapId::Snap(9);
        let mut b = oid_with("x");
        b.snap = SnapId::Snap(0x10);
        assert!(object_key(&cid, &a) < object_key(&cid, &b));
    }

    #[test]
    fn test_collection_range_contains_only_own_objects() {
        let c0 = CollectionId::new("c0");
        let c1 = CollectionId::new("c0x");
        let (start, end) = collection_range(&c0);
        let own = object_key(&c0, &oid_with("a"));
        let other = object_key(&c1, &oid_with("a"));
        assert!(own >= start && own < end);
        assert!(!(other >= start && other < end));
    }

    #[test]
    fn test_omap_ranges() {
        let cid = CollectionId::new("c");
        let okey = object_key(&cid, &oid_with("o"));
        let mut entry = okey.clone();
        entry.extend_from_slice(b"k1");

        let (estart, eend) = omap_entry_range(&okey);
        assert!(entry >= estart && entry < eend);
        // header row is excluded from the entry range
        assert!(okey < estart);

        let (fstart, fend) = omap_full_range(&okey);
        assert!(okey >= fstart && okey < fend);
        assert!(entry >= fstart && entry < fend);
    }

    #[test]
    fn test_prefix_successor_trailing_ff() {
        assert_eq!(prefix_successor(b"ab"), b"ac".to_vec());
        assert_eq!(prefix_successor(&[b'a', 0xff]), b"b".to_vec());
        assert_eq!(prefix_successor(&[0xff, 0xff]), Vec::<u8>::new());
    }

    #[test]
    fn test_wal_seq_key_order() {
        assert!(wal_seq_key(9) < wal_seq_key(10));
        assert!(wal_seq_key(0xff) < wal_seq_key(0x100));
        assert_eq!(parse_wal_seq_key(&wal_seq_key(12345)).unwrap(), 12345);
    }

    fn arb_field() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[a-z0-9%.!_/ ]{0,8}").unwrap()
    }

    fn arb_snap() -> impl Strategy<Value = SnapId> {
        prop_oneof![
            Just(SnapId::Head),
            Just(SnapId::SnapDir),
            any::<u64>().prop_map(SnapId::Snap),
        ]
    }

    fn arb_oid() -> impl Strategy<Value = Oid> {
        (
            any::<u8>(),
            any::<u32>(),
            any::<i64>(),
            arb_field(),
            arb_field(),
            arb_field(),
            arb_snap(),
            proptest::option::of(any::<u64>()),
        )
            .prop_map(
                |(shard, hash, pool, namespace, key, name, snap, generation)| Oid {
                    shard,
                    hash,
                    pool,
                    namespace,
                    key,
                    name,
                    snap,
                    generation,
                },
            )
    }

    proptest! {
        #[test]
        fn prop_roundtrip(oid in arb_oid(), cid in arb_field()) {
            let cid = CollectionId::new(cid);
            let key = object_key(&cid, &oid);
            let (cid2, oid2) = decode_object_key(&key).unwrap();
            prop_assert_eq!(cid2, cid);
            prop_assert_eq!(oid2, oid);
        }

        #[test]
        fn prop_injective(a in arb_oid(), b in arb_oid()) {
            let cid = CollectionId::new("c");
            if a != b {
                prop_assert_ne!(object_key(&cid, &a), object_key(&cid, &b));
            }
        }

        #[test]
        fn prop_prefix_free(a in arb_oid(), b in arb_oid()) {
            let cid = CollectionId::new("c");
            let ka = object_key(&cid, &a);
            let kb = object_key(&cid, &b);
            if ka != kb {
                prop_assert!(!kb.starts_with(&ka));
                prop_assert!(!ka.starts_with(&kb));
            }
        }
    }
}
