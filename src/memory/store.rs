//! Memory Store
//!
//! Owns the WAL writer and the snapshot store for one data directory and
//! keeps the in-memory state in step with the log.

use serde_json::Value;

use super::{MemoryOp, MemoryState, SnapshotStore, WorkingMemory};
use crate::config::LmfConfig;
use crate::error::{Error, Result};
use crate::notify::EventSink;
use crate::wal::{self, Lsn, RecordKind, WalWriter};

/// Durable working memory
pub struct MemoryStore {
    writer: WalWriter,
    snapshots: SnapshotStore,
    state: MemoryState,
}

impl MemoryStore {
    /// Open the store, recovering state from the latest snapshot and the WAL
    pub fn open(config: &LmfConfig, events: Option<EventSink>) -> Result<Self> {
        config.validate()?;

        let wal_dir = config.wal_dir();
        let writer = match events {
            Some(events) => WalWriter::open_with_events(&wal_dir, config.wal.clone(), events)?,
            None => WalWriter::open(&wal_dir, config.wal.clone())?,
        };

        let snapshots = SnapshotStore::new(config.snapshot_dir(), config.memory.snapshots_retained);
        let mut state = match snapshots.latest()? {
            Some(snapshot) => MemoryState::from_snapshot(snapshot),
            None => MemoryState::default(),
        };
        let snapshot_lsn = state.applied_lsn();

        // The log must continue from the snapshot, or LSNs would be reused
        if writer.last_lsn() < snapshot_lsn {
            return Err(Error::ReplayGap {
                expected: snapshot_lsn + 1,
                found: writer.next_lsn(),
            });
        }

        let mut replayed = 0u64;
        for record in wal::replay(&wal_dir, snapshot_lsn + 1)? {
            let record = record?;
            if replayed == 0 && record.lsn != snapshot_lsn + 1 {
                return Err(Error::ReplayGap {
                    expected: snapshot_lsn + 1,
                    found: record.lsn,
                });
            }
            state.apply(&record)?;
            replayed += 1;
        }

        if state.applied_lsn() != writer.last_lsn() {
            return Err(Error::ReplayGap {
                expected: writer.last_lsn(),
                found: state.applied_lsn(),
            });
        }

        tracing::info!(
            snapshot_lsn,
            replayed,
            tasks = state.tasks().len(),
            last_lsn = writer.last_lsn(),
            "Recovered working memory"
        );

        Ok(Self {
            writer,
            snapshots,
            state,
        })
    }

    pub fn set_goal(&mut self, task_id: &str, goal: impl Into<String>) -> Result<Lsn> {
        self.log_op(task_id, MemoryOp::SetGoal { goal: goal.into() })
    }

    pub fn add_constraint(&mut self, task_id: &str, constraint: impl Into<String>) -> Result<Lsn> {
        self.log_op(
            task_id,
            MemoryOp::AddConstraint {
                constraint: constraint.into(),
            },
        )
    }

    pub fn remove_constraint(&mut self, task_id: &str, constraint: impl Into<String>) -> Result<Lsn> {
        self.log_op(
            task_id,
            MemoryOp::RemoveConstraint {
                constraint: constraint.into(),
            },
        )
    }

    pub fn update_state(&mut self, task_id: &str, key: impl Into<String>, value: Value) -> Result<Lsn> {
        self.log_op(
            task_id,
            MemoryOp::UpdateStateKey {
                key: key.into(),
                value,
            },
        )
    }

    pub fn delete_state(&mut self, task_id: &str, key: impl Into<String>) -> Result<Lsn> {
        self.log_op(task_id, MemoryOp::DeleteStateKey { key: key.into() })
    }

    pub fn confirm_fact(&mut self, task_id: &str, fact: impl Into<String>) -> Result<Lsn> {
        self.log_op(task_id, MemoryOp::ConfirmFact { fact: fact.into() })
    }

    /// Log a liveness marker
    pub fn heartbeat(&mut self) -> Result<Lsn> {
        let lsn = self.writer.append(RecordKind::NoopHeartbeat, None, &[])?;
        self.state.mark_applied(lsn);
        Ok(lsn)
    }

    /// Snapshot the current state and drop the log it covers
    ///
    /// Returns the snapshot LSN.
    pub fn checkpoint(&mut self) -> Result<Lsn> {
        let lsn = self.writer.append(RecordKind::Checkpoint, None, &[])?;
        self.state.mark_applied(lsn);
        self.writer.sync()?;

        self.snapshots.save(&self.state.snapshot(lsn))?;

        self.writer.rotate()?;
        let removed = self.writer.truncate_through(lsn)?;
        tracing::info!(lsn, removed_segments = removed, "Checkpoint complete");
        Ok(lsn)
    }

    /// Make every logged mutation durable
    pub fn sync(&mut self) -> Result<Lsn> {
        self.writer.sync()
    }

    pub fn close(&mut self) -> Result<()> {
        self.writer.close()
    }

    pub fn task(&self, task_id: &str) -> Option<&WorkingMemory> {
        self.state.task(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &WorkingMemory> {
        self.state.tasks().values()
    }

    /// LSN of the last mutation reflected in memory
    pub fn applied_lsn(&self) -> Lsn {
        self.state.applied_lsn()
    }

    pub fn writer(&self) -> &WalWriter {
        &self.writer
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    fn log_op(&mut self, task_id: &str, op: MemoryOp) -> Result<Lsn> {
        let payload = op.encode()?;
        let lsn = self.writer.append(op.kind(), Some(task_id), &payload)?;
        self.state.apply_op(task_id, &op, lsn);
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsyncPolicy;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> LmfConfig {
        let mut config = LmfConfig::with_data_dir(dir);
        config.wal.fsync = FsyncPolicy::Explicit;
        config.wal.max_segment_bytes = 4096;
        config
    }

    #[test]
    fn test_mutations_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let mut store = MemoryStore::open(&config, None).unwrap();
            store.set_goal("t1", "index the repo").unwrap();
            store.add_constraint("t1", "read only").unwrap();
            store.update_state("t1", "files_seen", json!(12)).unwrap();
            store.confirm_fact("t2", "repo uses cargo").unwrap();
            store.heartbeat().unwrap();
            assert_eq!(store.sync().unwrap(), 5);
            store.close().unwrap();
        }

        let store = MemoryStore::open(&config, None).unwrap();
        let t1 = store.task("t1").unwrap();
        assert_eq!(t1.goal.as_deref(), Some("index the repo"));
        assert_eq!(t1.constraints, vec!["read only"]);
        assert_eq!(t1.state["files_seen"], json!(12));
        assert_eq!(store.task("t2").unwrap().facts, vec!["repo uses cargo"]);
        assert_eq!(store.tasks().count(), 2);
        assert_eq!(store.applied_lsn(), 5);
    }

    #[test]
    fn test_checkpoint_truncates_log() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let snapshot_lsn = {
            let mut store = MemoryStore::open(&config, None).unwrap();
            for i in 0..100 {
                store.update_state("t1", "counter", json!(i)).unwrap();
            }
            assert!(store.writer().segments().len() > 1);

            let lsn = store.checkpoint().unwrap();
            assert_eq!(lsn, 101);
            let segments = store.writer().segments();
            assert_eq!(segments.len(), 1);
            assert_eq!(segments[0].first_lsn, 102);

            store.remove_constraint("t1", "never added").unwrap();
            store.delete_state("t1", "counter").unwrap();
            store.close().unwrap();
            lsn
        };

        let store = MemoryStore::open(&config, None).unwrap();
        assert_eq!(store.snapshots().latest().unwrap().unwrap().lsn, snapshot_lsn);
        assert!(store.task("t1").unwrap().state.is_empty());
        assert_eq!(store.applied_lsn(), 103);
    }

    #[test]
    fn test_lost_log_is_a_replay_gap() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let mut store = MemoryStore::open(&config, None).unwrap();
            store.set_goal("t1", "g").unwrap();
            store.checkpoint().unwrap();
            store.close().unwrap();
        }

        std::fs::remove_dir_all(config.wal_dir()).unwrap();
        let err = MemoryStore::open(&config, None).err().unwrap();
        assert!(matches!(err, Error::ReplayGap { .. }));
    }
}
