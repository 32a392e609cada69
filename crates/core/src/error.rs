//! Error types for the fragstore object store
//!
//! One unified error enum covers the whole store. We use `thiserror` for
//! `Display` and `Error` trait implementations.
//!
//! Classification helpers encode the transaction-engine tolerance policy:
//! some per-op failures are swallowed during transaction decode (the op
//! becomes a no-op), everything else aborts the submission.

use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for fragstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the object store
#[derive(Debug, Error)]
pub enum Error {
    /// Object, collection, or key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity already exists where creation was requested
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Collection destroy requested on a non-empty collection
    #[error("not empty: {0}")]
    NotEmpty(String),

    /// Attribute or omap entry is absent
    #[error("no data: {0}")]
    NoData(String),

    /// Malformed input (bad opcode stream, bad config, bad key)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Device is out of space; the operator must recover
    #[error("no space left on device")]
    NoSpace,

    /// Underlying syscall or kv backend failure; carries the OS error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another instance holds the store (fsid lock is taken)
    #[error("store in use: {0}")]
    InUse(String),

    /// Injected fsid disagrees with the fsid on disk
    #[error("fsid mismatch: disk has {on_disk}, caller supplied {supplied}")]
    Mismatch {
        /// fsid read from the store root
        on_disk: Uuid,
        /// fsid injected by the caller
        supplied: Uuid,
    },

    /// Operation or backend is not supported
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// On-disk state failed validation (bad superblock, undecodable record)
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupt(format!("encoding: {}", e))
    }
}

impl Error {
    /// Convert an io error, promoting `ENOSPC` to the fatal `NoSpace` class.
    pub fn from_io(e: io::Error) -> Self {
        if e.raw_os_error() == Some(libc::ENOSPC) {
            Error::NoSpace
        } else {
            Error::Io(e)
        }
    }

    /// Check for the "not found" class
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check for the "no data" class (missing attr or omap entry)
    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::NoData(_))
    }

    /// Whether a per-op failure is swallowed during transaction decode.
    ///
    /// `NotFound` from read-modify ops and `NoData` from attr removal are
    /// tolerated; clone ops opt out of the `NotFound` tolerance at the call
    /// site. Everything else aborts the transaction.
    pub fn is_tolerated_in_txn(&self) -> bool {
        self.is_not_found() || self.is_no_data()
    }

    /// The OS error code, when this wraps a raw syscall failure.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_not_found() {
        let err = Error::NotFound("oid foo".to_string());
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains("oid foo"));
    }

    #[test]
    fn test_display_mismatch() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = Error::Mismatch {
            on_disk: a,
            supplied: b,
        };
        let msg = err.to_string();
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
    }

    #[test]
    fn test_from_io_preserves_code() {
        let io_err = io::Error::from_raw_os_error(libc::EACCES);
        let err: Error = io_err.into();
        assert_eq!(err.os_error(), Some(libc::EACCES));
    }

    #[test]
    fn test_from_io_maps_enospc() {
        let io_err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(matches!(Error::from_io(io_err), Error::NoSpace));

        let other = io::Error::from_raw_os_error(libc::EIO);
        assert!(matches!(Error::from_io(other), Error::Io(_)));
    }

    #[test]
    fn test_tolerance_classes() {
        assert!(Error::NotFound("x".into()).is_tolerated_in_txn());
        assert!(Error::NoData("x".into()).is_tolerated_in_txn());
        assert!(!Error::NotEmpty("x".into()).is_tolerated_in_txn());
        assert!(!Error::NoSpace.is_tolerated_in_txn());
        assert!(!Error::Corrupt("x".into()).is_tolerated_in_txn());
    }

    #[test]
    fn test_from_bincode_is_corrupt() {
        let bad = vec![0xffu8; 2];
        let r: std::result::Result<String, bincode::Error> = bincode::deserialize(&bad);
        let err: Error = r.unwrap_err().into();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
