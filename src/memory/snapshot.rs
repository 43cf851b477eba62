//! Snapshot Store
//!
//! Full working-memory snapshots, one JSON file per snapshot LSN. Files are
//! written to a temporary name, fsynced and renamed into place, so a reader
//! never sees a partial snapshot under its final name.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkingMemory;
use crate::error::{Error, Result};
use crate::wal::Lsn;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Working memory of every task as of `lsn`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every record up to and including this LSN is reflected
    pub lsn: Lsn,
    pub taken_at: DateTime<Utc>,
    pub tasks: BTreeMap<String, WorkingMemory>,
}

fn snapshot_file_name(lsn: Lsn) -> String {
    format!("{}{:020}{}", SNAPSHOT_PREFIX, lsn, SNAPSHOT_SUFFIX)
}

fn parse_snapshot_name(name: &str) -> Option<Lsn> {
    let digits = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(SNAPSHOT_SUFFIX)?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Directory of snapshot files
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retained: usize,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, retained: usize) -> Self {
        Self {
            dir: dir.into(),
            retained: retained.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a snapshot and prune old ones
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(snapshot_file_name(snapshot.lsn));
        let tmp_path = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)?;
        File::open(&self.dir)?.sync_all()?;

        tracing::info!(
            lsn = snapshot.lsn,
            tasks = snapshot.tasks.len(),
            bytes = bytes.len(),
            path = ?path,
            "Wrote working memory snapshot"
        );

        self.prune()?;
        Ok(path)
    }

    /// Snapshot files, oldest first
    pub fn list(&self) -> Result<Vec<(Lsn, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(lsn) = name.to_str().and_then(parse_snapshot_name) {
                snapshots.push((lsn, entry.path()));
            }
        }
        snapshots.sort_by_key(|(lsn, _)| *lsn);
        Ok(snapshots)
    }

    /// Newest snapshot that can be read back
    ///
    /// Unreadable snapshots are skipped in favour of older ones.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        for (lsn, path) in self.list()?.into_iter().rev() {
            match Self::load(&path) {
                Ok(snapshot) if snapshot.lsn == lsn => return Ok(Some(snapshot)),
                Ok(snapshot) => {
                    tracing::warn!(path = ?path, found = snapshot.lsn, "Snapshot LSN does not match file name, skipping");
                }
                Err(e) => {
                    tracing::warn!(path = ?path, "Skipping unreadable snapshot: {}", e);
                }
            }
        }
        Ok(None)
    }

    /// Read one snapshot file
    pub fn load(path: &Path) -> Result<Snapshot> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Snapshot(format!("Failed to parse {:?}: {}", path, e)))
    }

    /// Delete all but the newest retained snapshots
    pub fn prune(&self) -> Result<usize> {
        let snapshots = self.list()?;
        let excess = snapshots.len().saturating_sub(self.retained);

        for (lsn, path) in &snapshots[..excess] {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!(lsn, "Pruned snapshot"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(excess)
    }
}
