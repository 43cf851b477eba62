//! LMF WAL Configuration
//!
//! Configuration structures for the write-ahead log and the working-memory
//! layer built on it, loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::notify::NotifierConfig;

/// Smallest segment size accepted by validation
pub const MIN_SEGMENT_BYTES: u64 = 1024;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmfConfig {
    /// Storage locations
    pub storage: StorageConfig,

    /// Write-Ahead Log configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// Working-memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Operational event notifiers
    #[serde(default)]
    pub notifiers: Vec<NotifierConfig>,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; the WAL and snapshots live beneath it
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// When the writer fsyncs the active segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Sync after every append
    EveryRecord,
    /// Sync on the first append more than `interval_ms` after the last sync
    IntervalMs { interval_ms: u64 },
    /// Only `sync()` advances the durable LSN
    Explicit,
}

impl FsyncPolicy {
    /// Check whether an append observed `since_last_sync` after the last
    /// sync must sync
    pub fn sync_due(&self, since_last_sync: Duration) -> bool {
        match self {
            FsyncPolicy::EveryRecord => true,
            FsyncPolicy::IntervalMs { interval_ms } => {
                since_last_sync > Duration::from_millis(*interval_ms)
            }
            FsyncPolicy::Explicit => false,
        }
    }
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::IntervalMs {
            interval_ms: default_interval_ms(),
        }
    }
}

/// Write-Ahead Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Rotate before a record would push the active segment past this size
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,

    /// Capacity kept by the record encode buffer
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,

    /// Fsync policy
    #[serde(default)]
    pub fsync: FsyncPolicy,
}

/// Working-memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Number of snapshot files kept after a checkpoint
    #[serde(default = "default_snapshots_retained")]
    pub snapshots_retained: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/archillx/lmf")
}

fn default_max_segment_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_buffer_bytes() -> usize {
    64 * 1024
}

fn default_interval_ms() -> u64 {
    100
}

fn default_snapshots_retained() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: default_max_segment_bytes(),
            buffer_bytes: default_buffer_bytes(),
            fsync: FsyncPolicy::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            snapshots_retained: default_snapshots_retained(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl WalConfig {
    /// Validate the WAL section
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_segment_bytes < MIN_SEGMENT_BYTES {
            return Err(crate::Error::Config(format!(
                "wal.max_segment_bytes must be at least {}",
                MIN_SEGMENT_BYTES
            )));
        }

        if self.buffer_bytes == 0 {
            return Err(crate::Error::Config("wal.buffer_bytes cannot be zero".into()));
        }

        Ok(())
    }
}

impl LmfConfig {
    /// Configuration rooted at `data_dir` with every other value defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
            },
            wal: WalConfig::default(),
            memory: MemoryConfig::default(),
            logging: LoggingConfig::default(),
            notifiers: Vec::new(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LmfConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("storage.data_dir cannot be empty".into()));
        }

        self.wal.validate()?;

        if self.memory.snapshots_retained == 0 {
            return Err(crate::Error::Config(
                "memory.snapshots_retained must be at least 1".into(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be pretty or json, got {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.storage.data_dir
    }

    /// Get the WAL directory path
    pub fn wal_dir(&self) -> PathBuf {
        self.storage.data_dir.join("wal")
    }

    /// Get the snapshot directory path
    pub fn snapshot_dir(&self) -> PathBuf {
        self.storage.data_dir.join("snapshots")
    }
}
