//! LMF WAL Error Types

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for WAL and memory-layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error taxonomy, independent of the payload each variant carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    OversizedRecord,
    CorruptSegment,
    SegmentGap,
    Io,
    Poisoned,
    Closed,
    LockHeld,
    Config,
    Payload,
    Snapshot,
    ReplayGap,
}

/// LMF WAL error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Record errors
    #[error("Record {field} is {len} bytes, limit is {max}")]
    OversizedRecord {
        field: &'static str,
        len: usize,
        max: usize,
    },

    // Segment errors
    #[error("Sealed segment {path:?} corrupted at offset {offset}: {reason}")]
    CorruptSegment {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Segment gap before {path:?}: expected LSN {expected}, segment starts at {found}")]
    SegmentGap {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    // Writer state errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL writer is poisoned by an earlier I/O error; reopen required")]
    Poisoned,

    #[error("WAL writer is closed")]
    Closed,

    #[error("WAL directory {0:?} is locked by another writer")]
    LockHeld(PathBuf),

    // Memory layer errors
    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Payload serialization error: {0}")]
    PayloadSerialization(#[from] serde_json::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Replay gap: expected LSN {expected}, log resumes at {found}")]
    ReplayGap { expected: u64, found: u64 },
}

impl Error {
    /// Map this error onto the coarse taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => ErrorKind::Config,
            Error::OversizedRecord { .. } => ErrorKind::OversizedRecord,
            Error::CorruptSegment { .. } => ErrorKind::CorruptSegment,
            Error::SegmentGap { .. } => ErrorKind::SegmentGap,
            Error::Io(_) => ErrorKind::Io,
            Error::Poisoned => ErrorKind::Poisoned,
            Error::Closed => ErrorKind::Closed,
            Error::LockHeld(_) => ErrorKind::LockHeld,
            Error::Payload(_) | Error::PayloadSerialization(_) => ErrorKind::Payload,
            Error::Snapshot(_) => ErrorKind::Snapshot,
            Error::ReplayGap { .. } => ErrorKind::ReplayGap,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockHeld(_))
    }

    /// Check if this error requires operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptSegment { .. } | Error::SegmentGap { .. } | Error::ReplayGap { .. }
        )
    }

    /// Check if observing this error must poison the writer
    pub fn poisons_writer(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Poisoned.kind(), ErrorKind::Poisoned);
        assert_eq!(Error::Closed.kind(), ErrorKind::Closed);
        assert_eq!(
            Error::OversizedRecord { field: "payload", len: 10, max: 5 }.kind(),
            ErrorKind::OversizedRecord
        );

        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(io.poisons_writer());
        assert!(!Error::Poisoned.poisons_writer());
    }

    #[test]
    fn test_retryable_and_fatal() {
        assert!(Error::LockHeld(PathBuf::from("/tmp/wal")).is_retryable());
        assert!(!Error::Closed.is_retryable());

        let gap = Error::SegmentGap {
            path: PathBuf::from("00000000000000000010.wal"),
            expected: 8,
            found: 10,
        };
        assert!(gap.is_fatal());
        assert!(!Error::Poisoned.is_fatal());
    }
}
