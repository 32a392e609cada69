//! Store configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration recognized by the object store engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Fragment files per `fset` bucket directory before rotation
    pub max_bucket_size: u32,
    /// Backend name passed to the kv factory (`"redb"` or `"memory"`)
    pub kv_backend: String,
    /// Whether an `EIO` from statfs is fatal
    pub fail_eio: bool,
    /// Testing hook: commit wal entries but never hand them to the apply
    /// worker, and skip the apply drain at umount. Simulates a crash between
    /// the kv commit and the wal apply.
    pub defer_wal_apply: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_bucket_size: 1024,
            kv_backend: "redb".to_string(),
            fail_eio: true,
            defer_wal_apply: false,
        }
    }
}

impl StoreConfig {
    /// Validate option values before they reach the engine.
    pub fn validate(&self) -> Result<()> {
        if self.max_bucket_size == 0 {
            return Err(Error::InvalidArgument(
                "max_bucket_size must be at least 1".to_string(),
            ));
        }
        if self.kv_backend.is_empty() {
            return Err(Error::InvalidArgument(
                "kv_backend must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kv_backend, "redb");
        assert!(config.fail_eio);
        assert!(!config.defer_wal_apply);
    }

    #[test]
    fn test_zero_bucket_size_rejected() {
        let config = StoreConfig {
            max_bucket_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_backend_rejected() {
        let config = StoreConfig {
            kv_backend: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
