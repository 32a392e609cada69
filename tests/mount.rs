//! Mount exclusion and identity checks.

use fragstore::{Error, FragStore, Oid, Sequencer, StoreConfig, Transaction};
use uuid::Uuid;

#[test]
fn test_second_instance_fails_with_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let first = FragStore::new(&root, StoreConfig::default()).unwrap();
    first.mkfs().unwrap();
    first.mount().unwrap();

    let seq = Sequencer::new();
    let mut t = Transaction::new();
    t.create_collection("c0")
        .write("c0", Oid::head("a"), 0, b"safe".to_vec());
    first.queue_transactions(&seq, vec![t]).unwrap();

    // a second instance cannot take the fsid lock
    let second = FragStore::new(&root, StoreConfig::default()).unwrap();
    assert!(matches!(second.mount(), Err(Error::InUse(_))));

    // and the first instance's state is untouched
    assert_eq!(
        first.read(&"c0".into(), &Oid::head("a"), 0, 4).unwrap(),
        b"safe"
    );
    first.umount().unwrap();

    // once released, the second instance can mount
    second.mount().unwrap();
    second.umount().unwrap();
}

#[test]
fn test_double_mount_same_instance_fails() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let store = FragStore::new(&root, StoreConfig::default()).unwrap();
    store.mkfs().unwrap();
    store.mount().unwrap();
    assert!(matches!(store.mount(), Err(Error::InUse(_))));
    store.umount().unwrap();
}

#[test]
fn test_mount_unformatted_root_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        FragStore::new(dir.path().join("nothing-here"), StoreConfig::default()).unwrap();
    assert!(store.mount().is_err());
    assert!(!store.is_mounted());
}

#[test]
fn test_injected_fsid_is_written_at_format() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let fsid = Uuid::new_v4();

    let store = FragStore::new(&root, StoreConfig::default()).unwrap();
    store.set_fsid(fsid);
    store.mkfs().unwrap();

    let text = std::fs::read_to_string(root.join("fsid")).unwrap();
    assert_eq!(text.trim(), fsid.to_string());
}

#[test]
fn test_mismatched_fsid_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let store = FragStore::new(&root, StoreConfig::default()).unwrap();
    store.mkfs().unwrap();

    // a different injected identity must not mount this store
    let other = FragStore::new(&root, StoreConfig::default()).unwrap();
    other.set_fsid(Uuid::new_v4());
    assert!(matches!(other.mount(), Err(Error::Mismatch { .. })));

    // nor re-format it
    assert!(matches!(other.mkfs(), Err(Error::Mismatch { .. })));
}

#[test]
fn test_umount_without_mount_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = FragStore::new(dir.path().join("store"), StoreConfig::default()).unwrap();
    assert!(store.umount().is_err());
}

#[test]
fn test_unknown_backend_rejected_at_mount() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    // format with the default backend first
    let store = FragStore::new(&root, StoreConfig::default()).unwrap();
    store.mkfs().unwrap();

    let config = StoreConfig {
        kv_backend: "leveldb".to_string(),
        ..Default::default()
    };
    let bad = FragStore::new(&root, config).unwrap();
    assert!(matches!(bad.mount(), Err(Error::Unsupported(_))));
}
