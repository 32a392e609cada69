//! Fragment file allocation
//!
//! Fids are issued monotonically under one mutex. Buckets (`fragments/<fset>`)
//! are capped at `max_bucket_size` files; hitting the cap rotates to a fresh
//! bucket with `fno` reset to 1. Deletion is deferred to post-commit, so the
//! allocator only ever creates and opens files here.

use crate::paths::StorePaths;
use fragstore_core::{Error, Fid, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::DirBuilderExt;

pub(crate) struct FragmentAllocator {
    paths: StorePaths,
    max_bucket_size: u64,
    cur: Mutex<Fid>,
}

impl FragmentAllocator {
    pub fn new(paths: StorePaths, max_bucket_size: u32, watermark: Fid) -> Self {
        Self {
            paths,
            max_bucket_size: u64::from(max_bucket_size),
            cur: Mutex::new(watermark),
        }
    }

    /// Recover the highest fid present on disk by scanning the bucket
    /// directories. Used at mount together with the superblock watermark.
    pub fn scan_watermark(paths: &StorePaths) -> Result<Fid> {
        let max_entry = |dir: &std::path::Path| -> Result<Option<u64>> {
            let mut max = None;
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                    max = Some(max.map_or(n, |m: u64| m.max(n)));
                }
            }
            Ok(max)
        };

        let Some(fset) = max_entry(&paths.fragments_dir())? else {
            return Ok(Fid::none());
        };
        let fno = max_entry(&paths.bucket_dir(fset))?.unwrap_or(0);
        Ok(Fid::new(fset, fno))
    }

    /// The highest fid issued so far.
    pub fn current(&self) -> Fid {
        *self.cur.lock()
    }

    /// Issue the next fid and open its file for writing.
    ///
    /// The file is opened create+truncate, so a leftover from a crashed
    /// transaction that never committed cannot leak stale bytes.
    pub fn allocate(&self) -> Result<(Fid, File)> {
        let mut cur = self.cur.lock();
        let next = if cur.fset == 0 {
            Fid::new(1, 1)
        } else if cur.fno < self.max_bucket_size {
            Fid::new(cur.fset, cur.fno + 1)
        } else {
            Fid::new(cur.fset + 1, 1)
        };

        if next.fno == 1 {
            match std::fs::DirBuilder::new()
                .mode(0o755)
                .create(self.paths.bucket_dir(next.fset))
            {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::from_io(e)),
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.paths.fragment_file(next))
            .map_err(Error::from_io)?;
        *cur = next;
        Ok((next, file))
    }

    /// Open an existing fragment file. `None` when the file has already been
    /// unlinked (the object was removed while a wal entry was still queued).
    pub fn open_fid(&self, fid: Fid, write: bool) -> Result<Option<File>> {
        match OpenOptions::new()
            .read(true)
            .write(write)
            .open(self.paths.fragment_file(fid))
        {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Unlink a fragment file after its transaction committed. Missing files
    /// are fine (replayed post-commit cleanup is idempotent).
    pub fn remove_fid(&self, fid: Fid) -> Result<()> {
        match std::fs::remove_file(self.paths.fragment_file(fid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(max_bucket_size: u32) -> (tempfile::TempDir, FragmentAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("store"));
        paths.create_layout().unwrap();
        let alloc = FragmentAllocator::new(paths, max_bucket_size, Fid::none());
        (dir, alloc)
    }

    #[test]
    fn test_allocation_is_monotonic() {
        let (_dir, alloc) = setup(1024);
        let mut prev = Fid::none();
        for _ in 0..10 {
            let (fid, _f) = alloc.allocate().unwrap();
            assert!(fid > prev);
            prev = fid;
        }
        assert_eq!(alloc.current(), prev);
    }

    #[test]
    fn test_bucket_rotation() {
        let (_dir, alloc) = setup(2);
        let fids: Vec<Fid> = (0..5).map(|_| alloc.allocate().unwrap().0).collect();
        assert_eq!(
            fids,
            vec![
                Fid::new(1, 1),
                Fid::new(1, 2),
                Fid::new(2, 1),
                Fid::new(2, 2),
                Fid::new(3, 1),
            ]
        );
    }

    #[test]
    fn test_files_exist_and_remove() {
        let (_dir, alloc) = setup(1024);
        let (fid, file) = alloc.allocate().unwrap();
        drop(file);
        assert!(alloc.open_fid(fid, false).unwrap().is_some());

        alloc.remove_fid(fid).unwrap();
        assert!(alloc.open_fid(fid, false).unwrap().is_none());
        // removing again is a no-op
        alloc.remove_fid(fid).unwrap();
    }

    #[test]
    fn test_scan_watermark() {
        let (_dir, alloc) = setup(2);
        for _ in 0..3 {
            alloc.allocate().unwrap();
        }
        let scanned = FragmentAllocator::scan_watermark(&alloc.paths).unwrap();
        assert_eq!(scanned, Fid::new(2, 1));
    }

    #[test]
    fn test_scan_watermark_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("store"));
        paths.create_layout().unwrap();
        assert_eq!(
            FragmentAllocator::scan_watermark(&paths).unwrap(),
            Fid::none()
        );
    }

    #[test]
    fn test_resume_from_watermark() {
        let (_dir, alloc) = setup(1024);
        let (fid, _f) = alloc.allocate().unwrap();
        assert_eq!(fid, Fid::new(1, 1));

        // a fresh allocator resuming from the watermark continues above it
        let resumed = FragmentAllocator::new(alloc.paths.clone(), 1024, fid);
        let (next, _f) = resumed.allocate().unwrap();
        assert!(next > fid);
        assert_eq!(next, Fid::new(1, 2));
    }
}
