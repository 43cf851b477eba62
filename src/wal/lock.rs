//! WAL Directory Lock
//!
//! Advisory exclusive lock on `wal.lock`, held for the lifetime of a writer.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

/// Exclusive ownership of a WAL directory
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock without blocking
    ///
    /// Fails with `LockHeld` if another handle owns the directory, including
    /// another handle in this process.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let dir = lock_path.parent().unwrap_or(lock_path);
                return Err(Error::LockHeld(dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(lock = ?lock_path, "Acquired WAL directory lock");
        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock
    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        tracing::debug!(lock = ?self.path, "Released WAL directory lock");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.lock");

        let first = DirLock::acquire(&path).unwrap();
        let err = DirLock::acquire(&path).unwrap_err();
        assert!(matches!(err, Error::LockHeld(_)));

        first.release().unwrap();
        let second = DirLock::acquire(&path).unwrap();
        assert_eq!(second.path(), path.as_path());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.lock");

        {
            let _held = DirLock::acquire(&path).unwrap();
        }
        assert!(DirLock::acquire(&path).is_ok());
    }
}
