//! Core types for the fragstore object store
//!
//! This crate defines the foundational pieces shared by the kv adapter and
//! the engine:
//! - identifiers (`CollectionId`, `Oid`, `Fid`) and the persisted records
//!   built from them (`OnodeRecord`, `Superblock`)
//! - the canonical, order-preserving oid key codec (`keys`)
//! - the error taxonomy (`Error`, `Result`)
//! - store configuration (`StoreConfig`)

pub mod config;
pub mod error;
pub mod keys;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use types::{
    AllocHint, CollectionId, Fid, FragmentExtent, Oid, OnodeRecord, SnapId, Superblock,
    SUPERBLOCK_VERSION,
};
