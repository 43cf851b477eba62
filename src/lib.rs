//! LMF WAL - Durable Working Memory for the ArcHillx portal
//!
//! An append-only Write-Ahead Log of working-memory mutations, with
//! snapshot-driven truncation and crash recovery by replay.
//!
//! # Architecture
//!
//! Every mutation of an agent task's working memory (goal, constraints,
//! state keys, confirmed facts) is appended to the WAL before it is applied
//! in memory. The log lives in rotating segment files; periodic snapshots
//! let old segments be deleted. On restart the latest snapshot is loaded and
//! the log is replayed from just after it.
//!
//! # Features
//!
//! - Checksummed, length-prefixed records with dense 64-bit LSNs
//! - Size-based segment rotation and snapshot-driven truncation
//! - Torn-tail repair of the active segment at open
//! - Configurable fsync policy (every record, interval, explicit)
//! - Exclusive directory lock per writer process
//! - Sticky poisoning after I/O failure
//! - Operational notifications (webhook, Slack, Telegram, broadcast)

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod memory;
pub mod notify;
pub mod wal;

pub use config::LmfConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{FsyncPolicy, LmfConfig, WalConfig};
    pub use crate::context::{set_request_context, RequestContext};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::memory::{MemoryStore, WorkingMemory};
    pub use crate::notify::{EventDispatcher, EventSink, Notifier, WalEvent};
    pub use crate::wal::{replay, Lsn, Record, RecordKind, WalWriter};
}
