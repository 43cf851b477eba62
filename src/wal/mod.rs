//! Write-Ahead Log Module
//!
//! Durable, append-only log of working-memory mutations. Records live in
//! rotating segment files; the newest segment is the only one written to.

pub mod directory;
mod lock;
mod reader;
pub mod record;
pub mod segment;
mod writer;

pub use directory::{list_segments, SegmentDirectory, SegmentFile};
pub use lock::DirLock;
pub use reader::{replay, Replay, TruncationPoint};
pub use record::{Lsn, Record, RecordKind, TornReason, MAX_PAYLOAD_LEN};
pub use segment::SegmentMeta;
pub use writer::WalWriter;

use std::fs::File;
use std::path::PathBuf;

/// Name of the advisory lock file inside a WAL directory
pub const LOCK_FILE_NAME: &str = "wal.lock";

/// WAL directory structure
#[derive(Debug, Clone)]
pub struct WalPaths {
    pub base_dir: PathBuf,
}

impl WalPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get path for the segment starting at `first_lsn`
    pub fn segment_path(&self, first_lsn: Lsn) -> PathBuf {
        self.base_dir.join(segment::segment_file_name(first_lsn))
    }

    /// Get path for the directory lock
    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(LOCK_FILE_NAME)
    }

    /// Ensure WAL directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }

    /// Fsync the directory so creates and unlinks inside it are durable
    pub fn sync_dir(&self) -> std::io::Result<()> {
        File::open(&self.base_dir)?.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let paths = WalPaths::new(PathBuf::from("/data/wal"));
        assert_eq!(
            paths.segment_path(1890),
            PathBuf::from("/data/wal/00000000000000001890.wal")
        );
        assert_eq!(paths.lock_path(), PathBuf::from("/data/wal/wal.lock"));
    }
}
