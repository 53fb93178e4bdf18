//! Split model: chunk keys, key ranges, snapshot and binlog splits.
//!
//! Splits are the unit of work the assigner hands to readers. They are
//! immutable once created and serialize losslessly, because they travel
//! through checkpoint state and back.

use crate::error::Result;
use crate::offset::BinlogOffset;
use crate::schema::{ColumnType, TableId, TableSchema};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Split id of the singleton binlog split.
pub const BINLOG_SPLIT_ID: &str = "binlog-split";

/// One column value of a chunk key.
///
/// Ordered the way MySQL orders keys: NULL sorts lowest, numeric values
/// compare numerically across integer widths, text and binary compare
/// bytewise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl KeyValue {
    /// Rank of the value class; classes compare by rank, numbers share one.
    fn class_rank(&self) -> u8 {
        match self {
            KeyValue::Null => 0,
            KeyValue::Int(_) | KeyValue::UInt(_) | KeyValue::Float(_) => 1,
            KeyValue::Text(_) => 2,
            KeyValue::Bytes(_) => 3,
        }
    }

    /// Build a key value from a JSON column value.
    pub fn from_json(value: &serde_json::Value) -> KeyValue {
        use serde_json::Value;
        match value {
            Value::Null => KeyValue::Null,
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    KeyValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    KeyValue::UInt(u)
                } else {
                    KeyValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => KeyValue::Text(s.clone()),
            Value::Bool(b) => KeyValue::Int(i64::from(*b)),
            other => KeyValue::Text(other.to_string()),
        }
    }

    /// Render as a SQL literal for generated scan statements.
    pub fn to_sql_literal(&self) -> String {
        match self {
            KeyValue::Null => "NULL".to_string(),
            KeyValue::Int(i) => i.to_string(),
            KeyValue::UInt(u) => u.to_string(),
            KeyValue::Float(v) => v.to_string(),
            KeyValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            KeyValue::Bytes(b) => {
                let mut out = String::with_capacity(b.len() * 2 + 3);
                out.push_str("X'");
                for byte in b {
                    out.push_str(&format!("{byte:02X}"));
                }
                out.push('\'');
                out
            }
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use KeyValue::*;
        let rank = self.class_rank().cmp(&other.class_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Int(a), Int(b)) => a.cmp(b),
            (UInt(a), UInt(b)) => a.cmp(b),
            (Int(a), UInt(b)) => {
                if *a < 0 {
                    Ordering::Less
                } else {
                    (*a as u64).cmp(b)
                }
            }
            (UInt(a), Int(b)) => {
                if *b < 0 {
                    Ordering::Greater
                } else {
                    a.cmp(&(*b as u64))
                }
            }
            (Float(a), Float(b)) => a.total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), UInt(b)) => a.total_cmp(&(*b as f64)),
            (UInt(a), Float(b)) => (*a as f64).total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            _ => unreachable!("class ranks already matched"),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => write!(f, "NULL"),
            KeyValue::Int(i) => write!(f, "{i}"),
            KeyValue::UInt(u) => write!(f, "{u}"),
            KeyValue::Float(v) => write!(f, "{v}"),
            KeyValue::Text(s) => write!(f, "{s:?}"),
            KeyValue::Bytes(b) => write!(f, "0x{}", hex(b)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// An ordered tuple of chunk-key column values, compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey(pub Vec<KeyValue>);

impl ChunkKey {
    pub fn single(value: KeyValue) -> Self {
        Self(vec![value])
    }

    /// Extract a chunk key from a JSON row image.
    pub fn from_row(row: &serde_json::Value, columns: &[String]) -> ChunkKey {
        let values = columns
            .iter()
            .map(|col| {
                row.get(col)
                    .map(KeyValue::from_json)
                    .unwrap_or(KeyValue::Null)
            })
            .collect();
        ChunkKey(values)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// A half-open chunk-key range `[start, end)`; `None` endpoints mean the
/// range is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<ChunkKey>,
    pub end: Option<ChunkKey>,
}

impl KeyRange {
    /// The full keyspace `(-inf, +inf)`.
    pub fn full() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    pub fn new(start: Option<ChunkKey>, end: Option<ChunkKey>) -> Self {
        Self { start, end }
    }

    /// Whether `key` falls inside `[start, end)`.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        if let Some(start) = &self.start {
            if key < start {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= end {
                return false;
            }
        }
        true
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            Some(s) => write!(f, "[{s}, ")?,
            None => write!(f, "(-inf, ")?,
        }
        match &self.end {
            Some(e) => write!(f, "{e})"),
            None => write!(f, "+inf)"),
        }
    }
}

/// A key-range partition of one table; the unit of parallel snapshotting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSplit {
    /// `"{database}.{table}:{sequence}"`, stable across restores.
    pub split_id: String,
    pub table_id: TableId,
    pub chunk_key_columns: Vec<String>,
    pub range: KeyRange,
    /// Schema captured at discovery time; readers never re-resolve it.
    pub schema: TableSchema,
}

impl SnapshotSplit {
    pub fn new(table_id: TableId, sequence: u64, range: KeyRange, schema: TableSchema) -> Result<Self> {
        let chunk_key_columns = schema.chunk_key_columns()?.to_vec();
        Ok(Self {
            split_id: format!("{table_id}:{sequence}"),
            table_id,
            chunk_key_columns,
            range,
            schema,
        })
    }

    /// The `SELECT` statement a driver adapter runs to scan this split,
    /// ordered by chunk key. Composite keys use row-constructor syntax.
    pub fn scan_sql(&self) -> String {
        let key_list = self.chunk_key_columns.join(", ");
        let mut sql = format!("SELECT * FROM {} ", self.table_id);
        let mut clauses = Vec::new();
        if let Some(start) = &self.range.start {
            clauses.push(format!("({key_list}) >= ({})", sql_tuple(start)));
        }
        if let Some(end) = &self.range.end {
            clauses.push(format!("({key_list}) < ({})", sql_tuple(end)));
        }
        if !clauses.is_empty() {
            sql.push_str("WHERE ");
            sql.push_str(&clauses.join(" AND "));
            sql.push(' ');
        }
        sql.push_str(&format!("ORDER BY {key_list}"));
        sql
    }

    /// Record produced when this split finishes.
    pub fn finished(&self, high_watermark: BinlogOffset) -> FinishedSnapshotSplitInfo {
        FinishedSnapshotSplitInfo {
            split_id: self.split_id.clone(),
            table_id: self.table_id.clone(),
            range: self.range.clone(),
            high_watermark,
        }
    }
}

fn sql_tuple(key: &ChunkKey) -> String {
    key.0
        .iter()
        .map(KeyValue::to_sql_literal)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Metadata recorded when a snapshot split completes. Persisted in
/// assigner state and consulted by the binlog reader for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedSnapshotSplitInfo {
    pub split_id: String,
    pub table_id: TableId,
    pub range: KeyRange,
    pub high_watermark: BinlogOffset,
}

/// The singleton split streaming the binlog after the snapshot phase.
///
/// An empty `finished_snapshot_splits` list means pure binlog mode: stream
/// from `start_offset` with no dedup filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinlogSplit {
    pub split_id: String,
    pub chunk_key_types: Vec<ColumnType>,
    pub start_offset: BinlogOffset,
    pub stop_offset: BinlogOffset,
    pub finished_snapshot_splits: Vec<FinishedSnapshotSplitInfo>,
    pub table_schemas: Vec<TableSchema>,
}

impl BinlogSplit {
    pub fn new(
        chunk_key_types: Vec<ColumnType>,
        start_offset: BinlogOffset,
        stop_offset: BinlogOffset,
        finished_snapshot_splits: Vec<FinishedSnapshotSplitInfo>,
        table_schemas: Vec<TableSchema>,
    ) -> Self {
        Self {
            split_id: BINLOG_SPLIT_ID.to_string(),
            chunk_key_types,
            start_offset,
            stop_offset,
            finished_snapshot_splits,
            table_schemas,
        }
    }

    pub fn schema_for(&self, table_id: &TableId) -> Option<&TableSchema> {
        self.table_schemas.iter().find(|s| &s.table_id == table_id)
    }

    /// Where streaming actually starts.
    ///
    /// The minimum high watermark across finished splits — the reader
    /// never starts before it — unless the declared start offset is
    /// already past it (a restored split whose start offset was advanced
    /// by consumed progress resumes there instead of re-reading). With no
    /// finished splits the declared start offset is used as-is.
    pub fn starting_offset(&self) -> Result<BinlogOffset> {
        let mut min_watermark: Option<BinlogOffset> = None;
        for info in &self.finished_snapshot_splits {
            min_watermark = Some(match min_watermark {
                None => info.high_watermark.clone(),
                Some(current) => current.min(info.high_watermark.clone())?,
            });
        }
        match min_watermark {
            Some(watermark) => watermark.max(self.start_offset.clone()),
            None => Ok(self.start_offset.clone()),
        }
    }
}

/// A unit of work handed out by the assigner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Split {
    Snapshot(SnapshotSplit),
    Binlog(BinlogSplit),
}

impl Split {
    pub fn split_id(&self) -> &str {
        match self {
            Split::Snapshot(s) => &s.split_id,
            Split::Binlog(b) => &b.split_id,
        }
    }

    pub fn as_snapshot(&self) -> Option<&SnapshotSplit> {
        match self {
            Split::Snapshot(s) => Some(s),
            Split::Binlog(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    fn products_schema() -> TableSchema {
        TableSchema::new(
            TableId::new("shop", "products"),
            vec![
                ColumnSchema::new("id", ColumnType::Integer),
                ColumnSchema::new("name", ColumnType::Text).nullable(),
            ],
            vec!["id".into()],
        )
    }

    fn ik(v: i64) -> ChunkKey {
        ChunkKey::single(KeyValue::Int(v))
    }

    #[test]
    fn test_key_value_ordering() {
        assert!(KeyValue::Null < KeyValue::Int(i64::MIN));
        assert!(KeyValue::Int(-1) < KeyValue::UInt(0));
        assert!(KeyValue::Int(5) == KeyValue::UInt(5));
        assert!(KeyValue::Float(2.5) < KeyValue::Int(3));
        assert!(KeyValue::Int(9) < KeyValue::Text("0".into()));
        assert!(KeyValue::Text("abc".into()) < KeyValue::Text("abd".into()));
        assert!(KeyValue::Text("z".into()) < KeyValue::Bytes(vec![0]));
    }

    #[test]
    fn test_chunk_key_lexicographic() {
        let a = ChunkKey(vec![KeyValue::Int(1), KeyValue::Text("b".into())]);
        let b = ChunkKey(vec![KeyValue::Int(1), KeyValue::Text("c".into())]);
        let c = ChunkKey(vec![KeyValue::Int(2), KeyValue::Null]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new(Some(ik(5)), Some(ik(9)));
        assert!(!range.contains(&ik(4)));
        assert!(range.contains(&ik(5)));
        assert!(range.contains(&ik(8)));
        assert!(!range.contains(&ik(9)));

        assert!(KeyRange::full().contains(&ik(i64::MIN)));
        let open_end = KeyRange::new(Some(ik(9)), None);
        assert!(open_end.contains(&ik(1_000_000)));
        assert!(!open_end.contains(&ik(8)));
    }

    #[test]
    fn test_null_sorts_into_first_range() {
        let first = KeyRange::new(None, Some(ik(5)));
        assert!(first.contains(&ChunkKey::single(KeyValue::Null)));
    }

    #[test]
    fn test_scan_sql() {
        let split = SnapshotSplit::new(
            TableId::new("shop", "products"),
            1,
            KeyRange::new(Some(ik(5)), Some(ik(9))),
            products_schema(),
        )
        .unwrap();
        assert_eq!(split.split_id, "shop.products:1");
        assert_eq!(
            split.scan_sql(),
            "SELECT * FROM shop.products WHERE (id) >= (5) AND (id) < (9) ORDER BY id"
        );

        let full = SnapshotSplit::new(
            TableId::new("shop", "products"),
            0,
            KeyRange::full(),
            products_schema(),
        )
        .unwrap();
        assert_eq!(full.scan_sql(), "SELECT * FROM shop.products ORDER BY id");
    }

    #[test]
    fn test_sql_literal_escaping() {
        assert_eq!(KeyValue::Text("o'brien".into()).to_sql_literal(), "'o''brien'");
        assert_eq!(KeyValue::Bytes(vec![0xde, 0xad]).to_sql_literal(), "X'DEAD'");
        assert_eq!(KeyValue::Null.to_sql_literal(), "NULL");
    }

    #[test]
    fn test_finished_info_round_trip() {
        let split = SnapshotSplit::new(
            TableId::new("shop", "products"),
            2,
            KeyRange::new(Some(ik(9)), None),
            products_schema(),
        )
        .unwrap();
        let info = split.finished(BinlogOffset::new("mysql-bin.000002", 400));
        let json = serde_json::to_string(&info).unwrap();
        let restored: FinishedSnapshotSplitInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, restored);
    }

    #[test]
    fn test_binlog_split_starting_offset() {
        let schema = products_schema();
        let mk = |seq: u64, range: KeyRange, pos: u64| {
            SnapshotSplit::new(TableId::new("shop", "products"), seq, range, schema.clone())
                .unwrap()
                .finished(BinlogOffset::new("mysql-bin.000001", pos))
        };
        let split = BinlogSplit::new(
            vec![ColumnType::Integer],
            BinlogOffset::new("mysql-bin.000001", 4),
            BinlogOffset::NO_STOPPING,
            vec![
                mk(0, KeyRange::new(None, Some(ik(5))), 900),
                mk(1, KeyRange::new(Some(ik(5)), None), 300),
            ],
            vec![schema.clone()],
        );
        // Minimum high watermark across finished splits wins.
        assert_eq!(
            split.starting_offset().unwrap(),
            BinlogOffset::new("mysql-bin.000001", 300)
        );

        // A start offset advanced past the watermarks (restored progress)
        // wins over the minimum.
        let mut resumed = split.clone();
        resumed.start_offset = BinlogOffset::new("mysql-bin.000001", 5000);
        assert_eq!(
            resumed.starting_offset().unwrap(),
            BinlogOffset::new("mysql-bin.000001", 5000)
        );

        let pure = BinlogSplit::new(
            vec![ColumnType::Integer],
            BinlogOffset::new("mysql-bin.000009", 40),
            BinlogOffset::NO_STOPPING,
            vec![],
            vec![schema],
        );
        assert_eq!(
            pure.starting_offset().unwrap(),
            BinlogOffset::new("mysql-bin.000009", 40)
        );
    }
}
