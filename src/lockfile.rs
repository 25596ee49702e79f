//! Exclusive-ownership sentinel for a storage root.
//!
//! A `.lock` file containing the owner's PID asserts that exactly one
//! process has the engine open. The file is created with
//! `create_new`, so the check-and-claim is a single atomic syscall.

use crate::error::StoreError;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".lock";

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    owned: bool,
}

impl LockFile {
    /// Claims the storage root, failing with the holder's PID when the
    /// lock already exists. `ignore_existing` bypasses the check for
    /// offline inspection (fsck) and does not take ownership.
    pub fn acquire(storage_root: &Path, ignore_existing: bool) -> Result<Self, StoreError> {
        let path = storage_root.join(LOCK_FILE_NAME);
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut f) => {
                write!(f, "{}", std::process::id())?;
                f.sync_data()?;
                Ok(LockFile { path, owned: true })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if ignore_existing {
                    return Ok(LockFile { path, owned: false });
                }
                let pid = fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .unwrap_or(0);
                Err(StoreError::LockBusy { pid })
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Removes the sentinel. Idempotent; also runs on drop.
    pub fn release(&mut self) {
        if self.owned {
            let _ = fs::remove_file(&self.path);
            self.owned = false;
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_reports_holder_pid() {
        let dir = tempdir().unwrap();
        let _lock = LockFile::acquire(dir.path(), false).unwrap();
        match LockFile::acquire(dir.path(), false) {
            Err(StoreError::LockBusy { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected LockBusy, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn release_frees_the_root() {
        let dir = tempdir().unwrap();
        let mut lock = LockFile::acquire(dir.path(), false).unwrap();
        lock.release();
        assert!(LockFile::acquire(dir.path(), false).is_ok());
    }

    #[test]
    fn ignore_existing_opens_without_stealing() {
        let dir = tempdir().unwrap();
        let _owner = LockFile::acquire(dir.path(), false).unwrap();
        let inspector = LockFile::acquire(dir.path(), true).unwrap();
        drop(inspector);
        // The owner's lock file must still be there.
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }
}
