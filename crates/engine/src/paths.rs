//! Store root layout and the fsid file
//!
//! The root directory holds three things: the `fsid` file (instance
//! identity plus the mount-exclusion lock), the `fragments/` tree of
//! bucketed data files, and the kv backend's private `db/` tree.

use fragstore_core::{Error, Fid, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory layout under the store root
#[derive(Debug, Clone)]
pub(crate) struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fsid_file(&self) -> PathBuf {
        self.root.join("fsid")
    }

    pub fn fragments_dir(&self) -> PathBuf {
        self.root.join("fragments")
    }

    pub fn bucket_dir(&self, fset: u64) -> PathBuf {
        self.fragments_dir().join(fset.to_string())
    }

    pub fn fragment_file(&self, fid: Fid) -> PathBuf {
        self.bucket_dir(fid.fset).join(fid.fno.to_string())
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    /// Provision the root, `fragments/`, and `db/` directories (0755).
    pub fn create_layout(&self) -> Result<()> {
        for dir in [&self.root, &self.fragments_dir(), &self.db_dir()] {
            match std::fs::DirBuilder::new().mode(0o755).create(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::from_io(e)),
            }
        }
        Ok(())
    }

    /// Check that a formatted store is present before mounting.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(Error::NotFound(format!(
                "store root {} does not exist",
                self.root.display()
            )));
        }
        if !self.fragments_dir().is_dir() || !self.fsid_file().is_file() {
            return Err(Error::Corrupt(format!(
                "{} is not a formatted store",
                self.root.display()
            )));
        }
        Ok(())
    }
}

/// The open, possibly locked `fsid` file.
///
/// The advisory write lock is held for the lifetime of this handle; dropping
/// it (at umount, or when mount fails) releases the lock.
pub(crate) struct FsidFile {
    file: File,
}

impl FsidFile {
    /// Open `root/fsid`, creating it when formatting.
    pub fn open(paths: &StorePaths, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(paths.fsid_file())?;
        Ok(Self { file })
    }

    /// Take the exclusive advisory lock; a holder elsewhere means another
    /// instance has the store.
    pub fn lock(&self, paths: &StorePaths) -> Result<()> {
        self.file.try_lock_exclusive().map_err(|e| {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                Error::InUse(format!(
                    "fsid {} is locked by another instance",
                    paths.fsid_file().display()
                ))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Read the textual fsid. `None` means unset (empty file or nil uuid).
    pub fn read(&mut self) -> Result<Option<Uuid>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut text = String::new();
        self.file.read_to_string(&mut text)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let fsid = Uuid::parse_str(text)
            .map_err(|e| Error::Corrupt(format!("unparseable fsid {:?}: {}", text, e)))?;
        if fsid.is_nil() {
            Ok(None)
        } else {
            Ok(Some(fsid))
        }
    }

    /// Overwrite the file with the textual fsid and sync it.
    pub fn write(&mut self, fsid: Uuid) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(format!("{}\n", fsid).as_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let paths = StorePaths::new("/store");
        assert_eq!(paths.fsid_file(), PathBuf::from("/store/fsid"));
        assert_eq!(
            paths.fragment_file(Fid::new(3, 17)),
            PathBuf::from("/store/fragments/3/17")
        );
        assert_eq!(paths.db_dir(), PathBuf::from("/store/db"));
    }

    #[test]
    fn test_create_layout_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("store"));
        paths.create_layout().unwrap();
        paths.create_layout().unwrap();
        assert!(paths.fragments_dir().is_dir());
        assert!(paths.db_dir().is_dir());
    }

    #[test]
    fn test_fsid_generate_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("store"));
        paths.create_layout().unwrap();

        let mut f = FsidFile::open(&paths, true).unwrap();
        assert_eq!(f.read().unwrap(), None);

        let fsid = Uuid::new_v4();
        f.write(fsid).unwrap();
        assert_eq!(f.read().unwrap(), Some(fsid));

        // reopen sees the same value
        let mut f2 = FsidFile::open(&paths, false).unwrap();
        assert_eq!(f2.read().unwrap(), Some(fsid));
    }

    #[test]
    fn test_fsid_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("store"));
        paths.create_layout().unwrap();

        let first = FsidFile::open(&paths, true).unwrap();
        first.lock(&paths).unwrap();

        let second = FsidFile::open(&paths, false).unwrap();
        assert!(matches!(second.lock(&paths), Err(Error::InUse(_))));

        // dropping the holder releases the lock
        drop(first);
        second.lock(&paths).unwrap();
    }

    #[test]
    fn test_validate_rejects_unformatted() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("missing"));
        assert!(matches!(paths.validate(), Err(Error::NotFound(_))));

        std::fs::create_dir_all(dir.path().join("missing")).unwrap();
        assert!(matches!(paths.validate(), Err(Error::Corrupt(_))));
    }
}
