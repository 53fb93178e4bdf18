//! Checkpointable assigner state.
//!
//! The layout matches what the assigner needs to reconstruct its identity
//! after a restore: phase tag, per-table chunk cursors, pending and
//! in-flight snapshot splits (in-flight ones rerun from scratch), the
//! finished-split list, and the binlog split once constructed. Every
//! container is a `Vec` in deterministic order, so serialize →
//! deserialize → serialize is byte-identical.

use crate::chunk::ChunkCursor;
use crate::error::Result;
use crate::schema::TableSchema;
use crate::split::{BinlogSplit, FinishedSnapshotSplitInfo, SnapshotSplit};
use serde::{Deserialize, Serialize};

/// Phase of the split assigner's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignerPhase {
    Initial,
    DiscoveringTables,
    SnapshotAssigning,
    SnapshotDraining,
    BinlogAssigned,
    Terminal,
}

/// Serializable snapshot of the assigner, produced at every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignerState {
    pub phase: AssignerPhase,
    /// Captured table schemas, in discovery order.
    pub table_schemas: Vec<TableSchema>,
    /// Cursors of the tables not yet fully chunked, in assignment order.
    pub chunk_cursors: Vec<ChunkCursor>,
    /// Splits returned to the queue (worker failures, restores).
    pub pending_splits: Vec<SnapshotSplit>,
    /// Splits assigned to workers at checkpoint time; a restore moves
    /// them back to pending and they rerun from scratch.
    pub in_flight_splits: Vec<SnapshotSplit>,
    pub finished_splits: Vec<FinishedSnapshotSplitInfo>,
    /// Present from the moment the snapshot phase completes (or
    /// immediately in binlog-only mode).
    pub binlog_split: Option<BinlogSplit>,
}

impl AssignerState {
    /// Serialize for the external checkpoint store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Restore from checkpoint bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::int_key;
    use crate::offset::BinlogOffset;
    use crate::schema::{ColumnSchema, ColumnType, TableId};
    use crate::split::KeyRange;

    fn sample_state() -> AssignerState {
        let table_id = TableId::new("shop", "products");
        let schema = TableSchema::new(
            table_id.clone(),
            vec![ColumnSchema::new("id", ColumnType::Integer)],
            vec!["id".into()],
        );
        let split0 = SnapshotSplit::new(
            table_id.clone(),
            0,
            KeyRange::new(None, Some(int_key(5))),
            schema.clone(),
        )
        .unwrap();
        let split1 = SnapshotSplit::new(
            table_id.clone(),
            1,
            KeyRange::new(Some(int_key(5)), Some(int_key(9))),
            schema.clone(),
        )
        .unwrap();
        let mut cursor = crate::chunk::ChunkCursor::new(table_id);
        cursor.next_sequence = 2;
        cursor.last_boundary = Some(int_key(9));

        AssignerState {
            phase: AssignerPhase::SnapshotAssigning,
            table_schemas: vec![schema],
            chunk_cursors: vec![cursor],
            pending_splits: vec![split1],
            in_flight_splits: vec![split0.clone()],
            finished_splits: vec![split0.finished(BinlogOffset::new("mysql-bin.000001", 700))],
            binlog_split: None,
        }
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let state = sample_state();
        let bytes = state.to_bytes().unwrap();
        let restored = AssignerState::from_bytes(&bytes).unwrap();
        assert_eq!(state, restored);
    }

    #[test]
    fn test_reserialization_is_byte_identical() {
        let state = sample_state();
        let bytes = state.to_bytes().unwrap();
        let reserialized = AssignerState::from_bytes(&bytes).unwrap().to_bytes().unwrap();
        assert_eq!(bytes, reserialized);
    }
}
