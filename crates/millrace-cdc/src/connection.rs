//! Collaborator seams: the database connection, the binlog event stream,
//! the event sink, and the checkpoint store.
//!
//! Wire-format parsing and the driver itself live behind these traits. A
//! production deployment implements them over a MySQL driver; the
//! [`crate::memory`] module implements them in memory for tests.

use crate::error::Result;
use crate::event::ChangeEvent;
use crate::offset::BinlogOffset;
use crate::schema::TableId;
use crate::split::{ChunkKey, SnapshotSplit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Row-level operation decoded from the binlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// A decoded row change from the binlog stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub table_id: TableId,
    pub offset: BinlogOffset,
    pub op: RowOp,
    /// Row image before the change (`Update`, `Delete`).
    pub before: Option<serde_json::Value>,
    /// Row image after the change (`Insert`, `Update`).
    pub after: Option<serde_json::Value>,
    /// GTID of the originating transaction, if any.
    pub gtid: Option<String>,
}

impl RowEvent {
    /// The row image identifying the affected row.
    pub fn key_image(&self) -> Option<&serde_json::Value> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Extract the chunk key of the affected row.
    pub fn chunk_key(&self, columns: &[String]) -> Option<ChunkKey> {
        self.key_image().map(|row| ChunkKey::from_row(row, columns))
    }

    /// Flatten into emitted change events (updates become a retract pair).
    pub fn into_change_events(self) -> Vec<ChangeEvent> {
        use crate::event::SourceMeta;
        let mut meta = SourceMeta::streaming();
        if let Some(gtid) = self.gtid {
            meta = meta.with_gtid(gtid);
        }
        match self.op {
            RowOp::Insert => match self.after {
                Some(after) => vec![ChangeEvent::insert(self.table_id, self.offset, after, meta)],
                None => Vec::new(),
            },
            RowOp::Delete => match self.before {
                Some(before) => vec![ChangeEvent::delete(self.table_id, self.offset, before, meta)],
                None => Vec::new(),
            },
            RowOp::Update => match (self.before, self.after) {
                (Some(before), Some(after)) => {
                    ChangeEvent::update_pair(self.table_id, self.offset, before, after, meta)
                        .into_iter()
                        .collect()
                }
                // Degenerate images: emit whatever side exists.
                (None, Some(after)) => {
                    vec![ChangeEvent::insert(self.table_id, self.offset, after, meta)]
                }
                (Some(before), None) => {
                    vec![ChangeEvent::delete(self.table_id, self.offset, before, meta)]
                }
                (None, None) => Vec::new(),
            },
        }
    }
}

/// One event from the binlog stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BinlogEvent {
    /// A data change on one row.
    Row(RowEvent),
    /// A DDL statement affecting a captured table.
    SchemaChange {
        table_id: TableId,
        offset: BinlogOffset,
        ddl: String,
    },
    /// Server liveness marker; advances the offset without data.
    Heartbeat { offset: BinlogOffset },
}

impl BinlogEvent {
    pub fn offset(&self) -> &BinlogOffset {
        match self {
            BinlogEvent::Row(row) => &row.offset,
            BinlogEvent::SchemaChange { offset, .. } => offset,
            BinlogEvent::Heartbeat { offset } => offset,
        }
    }

    /// Whether the event is a row-level data change.
    pub fn is_data_change(&self) -> bool {
        matches!(self, BinlogEvent::Row(_))
    }

    pub fn table_id(&self) -> Option<&TableId> {
        match self {
            BinlogEvent::Row(row) => Some(&row.table_id),
            BinlogEvent::SchemaChange { table_id, .. } => Some(table_id),
            BinlogEvent::Heartbeat { .. } => None,
        }
    }
}

/// A live binlog subscription, positioned at a starting offset.
///
/// `next_event` blocks until the next event arrives, returns `Ok(None)`
/// when the server closes the stream, and surfaces transient failures as
/// retryable errors.
#[async_trait]
pub trait BinlogEventStream: Send {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>>;
}

/// A logical connection to the source database.
///
/// Cloning must yield an independent logical connection (driver adapters
/// are expected to wrap a pool handle), because each worker owns its own
/// connection.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    /// Read the server's current binlog position (`SHOW MASTER STATUS`).
    async fn current_offset(&self) -> Result<BinlogOffset>;

    /// Probe the minimum and maximum chunk key of a table; `None` when the
    /// table is empty.
    async fn key_span(
        &self,
        table_id: &TableId,
        columns: &[String],
    ) -> Result<Option<(ChunkKey, ChunkKey)>>;

    /// Approximate row count (information-schema statistics).
    async fn estimated_row_count(&self, table_id: &TableId) -> Result<u64>;

    /// Among rows with chunk key at or past `after` (all rows when
    /// `None`), in key order: the key of the row at position `chunk_size`.
    /// `None` when fewer rows remain, which makes the current chunk the
    /// final one.
    async fn next_chunk_boundary(
        &self,
        table_id: &TableId,
        columns: &[String],
        after: Option<&ChunkKey>,
        chunk_size: u64,
    ) -> Result<Option<ChunkKey>>;

    /// Scan a split's key range, ordered by chunk key. Rows are JSON
    /// objects keyed by column name.
    async fn scan_range(&self, split: &SnapshotSplit) -> Result<Vec<serde_json::Value>>;

    /// Resolve the earliest binlog offset at or after an epoch-millisecond
    /// timestamp (adapters search binlog file header timestamps).
    async fn offset_for_timestamp(&self, epoch_ms: i64) -> Result<BinlogOffset>;

    /// Open a binlog subscription from the given offset.
    async fn stream_binlog(&self, from: &BinlogOffset) -> Result<Box<dyn BinlogEventStream>>;
}

/// Destination for emitted change events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ChangeEvent) -> Result<()>;
}

/// External checkpoint store. Ids increase monotonically; the stored bytes
/// are the assigner state produced by the source's `checkpoint()`.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Allocate the next checkpoint id.
    fn next_checkpoint_id(&self) -> u64;

    /// Persist a checkpoint.
    async fn store(&self, checkpoint_id: u64, state: Vec<u8>) -> Result<()>;

    /// Load the most recent checkpoint, if any.
    async fn load_latest(&self) -> Result<Option<Vec<u8>>>;
}
