//! Change event representation.
//!
//! One event per row image: updates are flattened into an
//! `UpdateBefore`/`UpdateAfter` pair so downstream consumers can treat the
//! stream as retract-style changelog records. Row images are JSON objects
//! keyed by column name.

use crate::offset::BinlogOffset;
use crate::schema::TableId;
use crate::split::ChunkKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Operation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
    SchemaChange,
}

impl OpType {
    /// Whether this op changes row data (as opposed to schema/signal).
    pub fn is_data_change(&self) -> bool {
        !matches!(self, OpType::SchemaChange)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpType::Insert => "INSERT",
            OpType::UpdateBefore => "UPDATE_BEFORE",
            OpType::UpdateAfter => "UPDATE_AFTER",
            OpType::Delete => "DELETE",
            OpType::SchemaChange => "SCHEMA_CHANGE",
        };
        f.write_str(s)
    }
}

/// Capture metadata attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    /// Capture timestamp, Unix epoch milliseconds.
    pub timestamp_ms: i64,
    /// True when the event comes from a snapshot batch rather than the
    /// live binlog.
    pub snapshot: bool,
    /// GTID of the originating transaction, when the server runs GTIDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
}

impl SourceMeta {
    pub fn streaming() -> Self {
        Self {
            timestamp_ms: now_millis(),
            snapshot: false,
            gtid: None,
        }
    }

    pub fn snapshot() -> Self {
        Self {
            timestamp_ms: now_millis(),
            snapshot: true,
            gtid: None,
        }
    }

    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self
    }
}

/// A row-level change (or schema-change) emitted by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: OpType,
    pub table_id: TableId,
    pub offset: BinlogOffset,
    /// Previous row image (`UpdateBefore`, `Delete`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    /// Current row image (`Insert`, `UpdateAfter`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    pub source_meta: SourceMeta,
}

impl ChangeEvent {
    pub fn insert(
        table_id: TableId,
        offset: BinlogOffset,
        after: serde_json::Value,
        source_meta: SourceMeta,
    ) -> Self {
        Self {
            op: OpType::Insert,
            table_id,
            offset,
            before: None,
            after: Some(after),
            source_meta,
        }
    }

    pub fn delete(
        table_id: TableId,
        offset: BinlogOffset,
        before: serde_json::Value,
        source_meta: SourceMeta,
    ) -> Self {
        Self {
            op: OpType::Delete,
            table_id,
            offset,
            before: Some(before),
            after: None,
            source_meta,
        }
    }

    /// Build the retract pair for a row update.
    pub fn update_pair(
        table_id: TableId,
        offset: BinlogOffset,
        before: serde_json::Value,
        after: serde_json::Value,
        source_meta: SourceMeta,
    ) -> [Self; 2] {
        [
            Self {
                op: OpType::UpdateBefore,
                table_id: table_id.clone(),
                offset: offset.clone(),
                before: Some(before),
                after: None,
                source_meta: source_meta.clone(),
            },
            Self {
                op: OpType::UpdateAfter,
                table_id,
                offset,
                before: None,
                after: Some(after),
                source_meta,
            },
        ]
    }

    pub fn schema_change(
        table_id: TableId,
        offset: BinlogOffset,
        ddl: impl Into<String>,
    ) -> Self {
        Self {
            op: OpType::SchemaChange,
            table_id,
            offset,
            before: None,
            after: Some(serde_json::json!({ "ddl": ddl.into() })),
            source_meta: SourceMeta::streaming(),
        }
    }

    /// Whether this event carries row data.
    pub fn is_data_change(&self) -> bool {
        self.op.is_data_change()
    }

    /// The row image that identifies the affected row.
    pub fn row_image(&self) -> Option<&serde_json::Value> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Extract the chunk key of the affected row.
    pub fn chunk_key(&self, columns: &[String]) -> Option<ChunkKey> {
        self.row_image().map(|row| ChunkKey::from_row(row, columns))
    }
}

/// Current wall-clock time as Unix epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::KeyValue;
    use serde_json::json;

    fn table() -> TableId {
        TableId::new("shop", "products")
    }

    fn offset() -> BinlogOffset {
        BinlogOffset::new("mysql-bin.000001", 200)
    }

    #[test]
    fn test_insert_event() {
        let ev = ChangeEvent::insert(
            table(),
            offset(),
            json!({"id": 1, "name": "anvil"}),
            SourceMeta::snapshot(),
        );
        assert_eq!(ev.op, OpType::Insert);
        assert!(ev.before.is_none());
        assert!(ev.source_meta.snapshot);
        assert!(ev.is_data_change());
    }

    #[test]
    fn test_update_pair() {
        let [before, after] = ChangeEvent::update_pair(
            table(),
            offset(),
            json!({"id": 1, "name": "anvil"}),
            json!({"id": 1, "name": "hammer"}),
            SourceMeta::streaming(),
        );
        assert_eq!(before.op, OpType::UpdateBefore);
        assert_eq!(after.op, OpType::UpdateAfter);
        assert_eq!(before.offset, after.offset);
        assert!(before.after.is_none());
        assert!(after.before.is_none());
    }

    #[test]
    fn test_schema_change_is_not_data() {
        let ev = ChangeEvent::schema_change(table(), offset(), "ALTER TABLE products ADD sku INT");
        assert!(!ev.is_data_change());
    }

    #[test]
    fn test_chunk_key_extraction() {
        let cols = vec!["id".to_string()];
        let ev = ChangeEvent::delete(table(), offset(), json!({"id": 42}), SourceMeta::streaming());
        assert_eq!(
            ev.chunk_key(&cols).unwrap(),
            ChunkKey::single(KeyValue::Int(42))
        );

        // Missing key column maps to NULL, which sorts lowest.
        let ev = ChangeEvent::delete(table(), offset(), json!({"other": 1}), SourceMeta::streaming());
        assert_eq!(
            ev.chunk_key(&cols).unwrap(),
            ChunkKey::single(KeyValue::Null)
        );
    }
}
