//! Working Memory Module
//!
//! Per-task LMF working memory rebuilt from the latest snapshot plus a WAL
//! replay. Every mutation is logged before it is applied in memory.

mod snapshot;
mod store;

pub use snapshot::{Snapshot, SnapshotStore};
pub use store::MemoryStore;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::wal::{Lsn, Record, RecordKind};

/// Working memory of one task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub task_id: String,
    pub goal: Option<String>,
    pub constraints: Vec<String>,
    pub state: BTreeMap<String, Value>,
    /// Confirmed facts, in confirmation order
    pub facts: Vec<String>,
    /// LSN of the last mutation applied to this task
    pub last_lsn: Lsn,
}

impl WorkingMemory {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    fn apply(&mut self, op: &MemoryOp, lsn: Lsn) {
        match op {
            MemoryOp::SetGoal { goal } => self.goal = Some(goal.clone()),
            MemoryOp::AddConstraint { constraint } => {
                if !self.constraints.contains(constraint) {
                    self.constraints.push(constraint.clone());
                }
            }
            MemoryOp::RemoveConstraint { constraint } => {
                self.constraints.retain(|c| c != constraint);
            }
            MemoryOp::UpdateStateKey { key, value } => {
                self.state.insert(key.clone(), value.clone());
            }
            MemoryOp::DeleteStateKey { key } => {
                self.state.remove(key);
            }
            MemoryOp::ConfirmFact { fact } => {
                if !self.facts.contains(fact) {
                    self.facts.push(fact.clone());
                }
            }
        }
        self.last_lsn = lsn;
    }
}

/// A task-scoped mutation carried in a WAL record payload
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryOp {
    SetGoal { goal: String },
    AddConstraint { constraint: String },
    RemoveConstraint { constraint: String },
    UpdateStateKey { key: String, value: Value },
    DeleteStateKey { key: String },
    ConfirmFact { fact: String },
}

impl MemoryOp {
    /// Record kind this operation is logged as
    pub fn kind(&self) -> RecordKind {
        match self {
            MemoryOp::SetGoal { .. } => RecordKind::SetGoal,
            MemoryOp::AddConstraint { .. } => RecordKind::AddConstraint,
            MemoryOp::RemoveConstraint { .. } => RecordKind::RemoveConstraint,
            MemoryOp::UpdateStateKey { .. } => RecordKind::UpdateStateKey,
            MemoryOp::DeleteStateKey { .. } => RecordKind::DeleteStateKey,
            MemoryOp::ConfirmFact { .. } => RecordKind::ConfirmFact,
        }
    }

    /// JSON payload bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            MemoryOp::SetGoal { goal } => json!({ "goal": goal }),
            MemoryOp::AddConstraint { constraint } | MemoryOp::RemoveConstraint { constraint } => {
                json!({ "constraint": constraint })
            }
            MemoryOp::UpdateStateKey { key, value } => json!({ "key": key, "value": value }),
            MemoryOp::DeleteStateKey { key } => json!({ "key": key }),
            MemoryOp::ConfirmFact { fact } => json!({ "fact": fact }),
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Decode the payload of a task-scoped record
    ///
    /// Returns `Ok(None)` for kinds that carry no memory operation.
    pub fn decode(kind: RecordKind, payload: &[u8]) -> Result<Option<Self>> {
        let op_kind = matches!(
            kind,
            RecordKind::SetGoal
                | RecordKind::AddConstraint
                | RecordKind::RemoveConstraint
                | RecordKind::UpdateStateKey
                | RecordKind::DeleteStateKey
                | RecordKind::ConfirmFact
        );
        if !op_kind {
            return Ok(None);
        }

        let body: Value = serde_json::from_slice(payload)?;
        let op = match kind {
            RecordKind::SetGoal => MemoryOp::SetGoal {
                goal: string_field(&body, kind, "goal")?,
            },
            RecordKind::AddConstraint => MemoryOp::AddConstraint {
                constraint: string_field(&body, kind, "constraint")?,
            },
            RecordKind::RemoveConstraint => MemoryOp::RemoveConstraint {
                constraint: string_field(&body, kind, "constraint")?,
            },
            RecordKind::UpdateStateKey => MemoryOp::UpdateStateKey {
                key: string_field(&body, kind, "key")?,
                value: body.get("value").cloned().unwrap_or(Value::Null),
            },
            RecordKind::DeleteStateKey => MemoryOp::DeleteStateKey {
                key: string_field(&body, kind, "key")?,
            },
            _ => MemoryOp::ConfirmFact {
                fact: string_field(&body, kind, "fact")?,
            },
        };
        Ok(Some(op))
    }
}

fn string_field(body: &Value, kind: RecordKind, field: &str) -> Result<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Payload(format!("{} payload missing string field '{}'", kind, field)))
}

/// Working memory of every task, as of `applied_lsn`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    tasks: BTreeMap<String, WorkingMemory>,
    applied_lsn: Lsn,
}

impl MemoryState {
    /// State restored from a snapshot
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            tasks: snapshot.tasks,
            applied_lsn: snapshot.lsn,
        }
    }

    /// Snapshot of the current state, taken at `lsn`
    pub fn snapshot(&self, lsn: Lsn) -> Snapshot {
        Snapshot {
            lsn,
            taken_at: chrono::Utc::now(),
            tasks: self.tasks.clone(),
        }
    }

    /// Apply one replayed record
    pub fn apply(&mut self, record: &Record) -> Result<()> {
        match record.kind {
            RecordKind::Checkpoint | RecordKind::NoopHeartbeat => {}
            RecordKind::Unknown(code) => {
                tracing::warn!(lsn = record.lsn, code, "Skipping record of unknown kind");
            }
            kind => {
                let task_id = record.task_id.as_deref().ok_or_else(|| {
                    Error::Payload(format!("{} record at LSN {} has no task id", kind, record.lsn))
                })?;
                if let Some(op) = MemoryOp::decode(kind, &record.payload)? {
                    self.apply_op(task_id, &op, record.lsn);
                    return Ok(());
                }
            }
        }
        self.mark_applied(record.lsn);
        Ok(())
    }

    /// Apply an operation already logged at `lsn`
    pub fn apply_op(&mut self, task_id: &str, op: &MemoryOp, lsn: Lsn) {
        self.tasks
            .entry(task_id.to_string())
            .or_insert_with(|| WorkingMemory::new(task_id))
            .apply(op, lsn);
        self.mark_applied(lsn);
    }

    /// Advance past a record that changes no task
    pub fn mark_applied(&mut self, lsn: Lsn) {
        self.applied_lsn = self.applied_lsn.max(lsn);
    }

    pub fn applied_lsn(&self) -> Lsn {
        self.applied_lsn
    }

    pub fn task(&self, task_id: &str) -> Option<&WorkingMemory> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> &BTreeMap<String, WorkingMemory> {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lsn: Lsn, op: &MemoryOp, task: Option<&str>) -> Record {
        Record::new(lsn, op.kind(), task.map(str::to_string), op.encode().unwrap())
    }

    #[test]
    fn test_op_payload_roundtrip() {
        let ops = vec![
            MemoryOp::SetGoal { goal: "summarize logs".into() },
            MemoryOp::UpdateStateKey {
                key: "cursor".into(),
                value: json!({ "page": 3, "tags": ["a", "b"] }),
            },
            MemoryOp::DeleteStateKey { key: "cursor".into() },
        ];
        for op in ops {
            let decoded = MemoryOp::decode(op.kind(), &op.encode().unwrap()).unwrap();
            assert_eq!(decoded, Some(op));
        }
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        let err = MemoryOp::decode(RecordKind::SetGoal, br#"{"goal": 7}"#).unwrap_err();
        assert!(matches!(err, Error::Payload(_)));

        let err = MemoryOp::decode(RecordKind::ConfirmFact, b"not json").unwrap_err();
        assert!(matches!(err, Error::PayloadSerialization(_)));

        assert_eq!(MemoryOp::decode(RecordKind::Checkpoint, b"").unwrap(), None);
    }

    #[test]
    fn test_apply_records() {
        let mut state = MemoryState::default();
        let ops = [
            MemoryOp::SetGoal { goal: "g1".into() },
            MemoryOp::AddConstraint { constraint: "no network".into() },
            MemoryOp::AddConstraint { constraint: "no network".into() },
            MemoryOp::UpdateStateKey { key: "step".into(), value: json!(1) },
            MemoryOp::UpdateStateKey { key: "step".into(), value: json!(2) },
            MemoryOp::ConfirmFact { fact: "disk is ext4".into() },
            MemoryOp::RemoveConstraint { constraint: "absent".into() },
        ];
        for (i, op) in ops.iter().enumerate() {
            state.apply(&record(i as Lsn + 1, op, Some("t1"))).unwrap();
        }

        let task = state.task("t1").unwrap();
        assert_eq!(task.goal.as_deref(), Some("g1"));
        assert_eq!(task.constraints, vec!["no network"]);
        assert_eq!(task.state["step"], json!(2));
        assert_eq!(task.facts, vec!["disk is ext4"]);
        assert_eq!(task.last_lsn, 7);
        assert_eq!(state.applied_lsn(), 7);
    }

    #[test]
    fn test_apply_non_task_kinds() {
        let mut state = MemoryState::default();
        state
            .apply(&Record::new(1, RecordKind::Checkpoint, None, Vec::new()))
            .unwrap();
        state
            .apply(&Record::new(2, RecordKind::Unknown(0xFE), None, b"?".to_vec()))
            .unwrap();
        state
            .apply(&Record::new(3, RecordKind::NoopHeartbeat, None, Vec::new()))
            .unwrap();

        assert!(state.tasks().is_empty());
        assert_eq!(state.applied_lsn(), 3);
    }

    #[test]
    fn test_task_record_requires_task_id() {
        let mut state = MemoryState::default();
        let op = MemoryOp::ConfirmFact { fact: "f".into() };
        let err = state.apply(&record(1, &op, None)).unwrap_err();
        assert!(matches!(err, Error::Payload(_)));
        assert_eq!(state.applied_lsn(), 0);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut state = MemoryState::default();
        state.apply_op("t1", &MemoryOp::SetGoal { goal: "g".into() }, 1);
        state.apply_op("t2", &MemoryOp::ConfirmFact { fact: "f".into() }, 2);

        let restored = MemoryState::from_snapshot(state.snapshot(2));
        assert_eq!(restored, state);
    }
}
