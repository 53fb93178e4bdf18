//! In-memory implementations of the collaborator traits.
//!
//! [`MemoryDatabase`] models a MySQL server: tables keyed by primary key,
//! an append-only binlog, and a current position that advances on every
//! mutation. Cloning yields another handle to the same server, matching
//! the pool semantics real adapters have. Used by unit and integration
//! tests; not intended for production.

use crate::connection::{
    BinlogEvent, BinlogEventStream, Checkpointer, EventSink, RowEvent, RowOp, SqlConnection,
};
use crate::error::{CdcError, Result};
use crate::event::ChangeEvent;
use crate::offset::BinlogOffset;
use crate::schema::{TableId, TableSchema, TableSchemaProvider};
use crate::split::{ChunkKey, KeyValue, SnapshotSplit};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Byte distance between consecutive binlog events.
const EVENT_STRIDE: u64 = 100;

struct MemoryTable {
    schema: TableSchema,
    /// Rows keyed by primary key.
    rows: BTreeMap<ChunkKey, serde_json::Value>,
}

impl MemoryTable {
    fn primary_key(&self, row: &serde_json::Value) -> ChunkKey {
        let columns = if self.schema.primary_key.is_empty() {
            &self.schema.chunk_key
        } else {
            &self.schema.primary_key
        };
        ChunkKey::from_row(row, columns)
    }

    fn chunk_key(&self, row: &serde_json::Value) -> ChunkKey {
        let columns = self
            .schema
            .chunk_key_columns()
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        ChunkKey::from_row(row, &columns)
    }
}

struct DbInner {
    tables: BTreeMap<TableId, MemoryTable>,
    binlog: Vec<BinlogEvent>,
    file_index: u64,
    position: u64,
    /// Offsets strictly before this one have been pruned.
    purged_before: Option<BinlogOffset>,
    /// Pending transient failures injected into `scan_range`.
    scan_faults: u32,
    /// Positions at which an open stream fails once with a transient error.
    stream_faults: VecDeque<u64>,
}

impl DbInner {
    fn filename(&self) -> String {
        format!("mysql-bin.{:06}", self.file_index)
    }

    fn head(&self) -> BinlogOffset {
        BinlogOffset::new(self.filename(), self.position)
    }

    fn advance(&mut self) -> BinlogOffset {
        self.position += EVENT_STRIDE;
        self.head()
    }

    fn table_mut(&mut self, table_id: &TableId) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(table_id)
            .ok_or_else(|| CdcError::config(format!("unknown table {table_id}")))
    }
}

/// An in-memory stand-in for a MySQL server plus driver.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<DbInner>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DbInner {
                tables: BTreeMap::new(),
                binlog: Vec::new(),
                file_index: 1,
                position: 4,
                purged_before: None,
                scan_faults: 0,
                stream_faults: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a table.
    pub fn create_table(&self, schema: TableSchema) {
        let mut inner = self.lock();
        inner.tables.insert(
            schema.table_id.clone(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Load rows without generating binlog events (pre-capture history).
    pub fn seed(&self, table_id: &TableId, rows: impl IntoIterator<Item = serde_json::Value>) {
        let mut inner = self.lock();
        let table = inner.tables.get_mut(table_id).expect("table exists");
        for row in rows {
            let key = table.primary_key(&row);
            table.rows.insert(key, row);
        }
    }

    /// Apply an insert and append it to the binlog.
    pub fn insert(&self, table_id: &TableId, row: serde_json::Value) -> BinlogOffset {
        let mut inner = self.lock();
        let offset = inner.advance();
        let table = inner.table_mut(table_id).expect("table exists");
        let key = table.primary_key(&row);
        table.rows.insert(key, row.clone());
        inner.binlog.push(BinlogEvent::Row(RowEvent {
            table_id: table_id.clone(),
            offset: offset.clone(),
            op: RowOp::Insert,
            before: None,
            after: Some(row),
            gtid: None,
        }));
        offset
    }

    /// Apply an update (keyed by primary key) and append it to the binlog.
    pub fn update(&self, table_id: &TableId, row: serde_json::Value) -> BinlogOffset {
        let mut inner = self.lock();
        let offset = inner.advance();
        let table = inner.table_mut(table_id).expect("table exists");
        let key = table.primary_key(&row);
        let before = table.rows.insert(key, row.clone());
        inner.binlog.push(BinlogEvent::Row(RowEvent {
            table_id: table_id.clone(),
            offset: offset.clone(),
            op: RowOp::Update,
            before,
            after: Some(row),
            gtid: None,
        }));
        offset
    }

    /// Apply a delete (row identified by its key columns).
    pub fn delete(&self, table_id: &TableId, row: serde_json::Value) -> BinlogOffset {
        let mut inner = self.lock();
        let offset = inner.advance();
        let table = inner.table_mut(table_id).expect("table exists");
        let key = table.primary_key(&row);
        let before = table.rows.remove(&key).unwrap_or(row);
        inner.binlog.push(BinlogEvent::Row(RowEvent {
            table_id: table_id.clone(),
            offset: offset.clone(),
            op: RowOp::Delete,
            before: Some(before),
            after: None,
            gtid: None,
        }));
        offset
    }

    /// Append a schema-change event.
    pub fn schema_change(&self, table_id: &TableId, ddl: impl Into<String>) -> BinlogOffset {
        let mut inner = self.lock();
        let offset = inner.advance();
        inner.binlog.push(BinlogEvent::SchemaChange {
            table_id: table_id.clone(),
            offset: offset.clone(),
            ddl: ddl.into(),
        });
        offset
    }

    /// Append a heartbeat event.
    pub fn heartbeat(&self) -> BinlogOffset {
        let mut inner = self.lock();
        let offset = inner.advance();
        inner.binlog.push(BinlogEvent::Heartbeat {
            offset: offset.clone(),
        });
        offset
    }

    /// Rotate to the next binlog file.
    pub fn rotate_log(&self) {
        let mut inner = self.lock();
        inner.file_index += 1;
        inner.position = 4;
    }

    /// Prune binlog history strictly before `offset`.
    pub fn purge_binlog_before(&self, offset: BinlogOffset) {
        let mut inner = self.lock();
        inner
            .binlog
            .retain(|e| !e.offset().is_before(&offset).unwrap_or(false));
        inner.purged_before = Some(offset);
    }

    /// Make the next `count` range scans fail with a transient error.
    pub fn inject_scan_faults(&self, count: u32) {
        self.lock().scan_faults = count;
    }

    /// Make a stream fail once with a transient error when it reaches an
    /// event at or past `position` (in the current file).
    pub fn inject_stream_fault_at(&self, position: u64) {
        self.lock().stream_faults.push_back(position);
    }

    /// The server's current binlog head.
    pub fn head_offset(&self) -> BinlogOffset {
        self.lock().head()
    }
}

#[async_trait]
impl SqlConnection for MemoryDatabase {
    async fn current_offset(&self) -> Result<BinlogOffset> {
        Ok(self.lock().head())
    }

    async fn key_span(
        &self,
        table_id: &TableId,
        columns: &[String],
    ) -> Result<Option<(ChunkKey, ChunkKey)>> {
        let inner = self.lock();
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| CdcError::config(format!("unknown table {table_id}")))?;
        let mut keys = table
            .rows
            .values()
            .map(|row| ChunkKey::from_row(row, columns));
        let Some(first) = keys.next() else {
            return Ok(None);
        };
        let (min, max) = keys.fold((first.clone(), first), |(lo, hi), k| {
            let lo = if k < lo { k.clone() } else { lo };
            let hi = if k > hi { k } else { hi };
            (lo, hi)
        });
        Ok(Some((min, max)))
    }

    async fn estimated_row_count(&self, table_id: &TableId) -> Result<u64> {
        let inner = self.lock();
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| CdcError::config(format!("unknown table {table_id}")))?;
        Ok(table.rows.len() as u64)
    }

    async fn next_chunk_boundary(
        &self,
        table_id: &TableId,
        columns: &[String],
        after: Option<&ChunkKey>,
        chunk_size: u64,
    ) -> Result<Option<ChunkKey>> {
        let inner = self.lock();
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| CdcError::config(format!("unknown table {table_id}")))?;
        let mut keys: Vec<ChunkKey> = table
            .rows
            .values()
            .map(|row| ChunkKey::from_row(row, columns))
            .filter(|k| after.map_or(true, |a| k >= a))
            .collect();
        keys.sort();
        Ok(keys.into_iter().nth(chunk_size as usize))
    }

    async fn scan_range(&self, split: &SnapshotSplit) -> Result<Vec<serde_json::Value>> {
        let mut inner = self.lock();
        if inner.scan_faults > 0 {
            inner.scan_faults -= 1;
            return Err(CdcError::transient("scan connection reset"));
        }
        let table = inner
            .tables
            .get(&split.table_id)
            .ok_or_else(|| CdcError::config(format!("unknown table {}", split.table_id)))?;
        let mut rows: Vec<(ChunkKey, serde_json::Value)> = table
            .rows
            .values()
            .map(|row| (table.chunk_key(row), row.clone()))
            .filter(|(key, _)| split.range.contains(key))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    async fn offset_for_timestamp(&self, _epoch_ms: i64) -> Result<BinlogOffset> {
        // The in-memory binlog carries no wall-clock timestamps; resolve
        // to the start of retained history.
        let inner = self.lock();
        Ok(inner
            .purged_before
            .clone()
            .unwrap_or(BinlogOffset::EARLIEST))
    }

    async fn stream_binlog(&self, from: &BinlogOffset) -> Result<Box<dyn BinlogEventStream>> {
        let inner = self.lock();
        if let Some(purged) = &inner.purged_before {
            if from.is_before(purged).unwrap_or(false) {
                return Err(CdcError::BinlogPositionLost(from.to_string()));
            }
        }
        Ok(Box::new(MemoryBinlogStream {
            db: self.inner.clone(),
            cursor: from.clone(),
        }))
    }
}

/// Stream over the recorded binlog; returns `Ok(None)` at the head.
struct MemoryBinlogStream {
    db: Arc<Mutex<DbInner>>,
    cursor: BinlogOffset,
}

#[async_trait]
impl BinlogEventStream for MemoryBinlogStream {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        let mut inner = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let next = inner
            .binlog
            .iter()
            .find(|e| e.offset().is_after(&self.cursor).unwrap_or(false))
            .cloned();
        let Some(event) = next else {
            return Ok(None);
        };
        if let Some(&fault) = inner.stream_faults.front() {
            if event.offset().position >= fault {
                inner.stream_faults.pop_front();
                return Err(CdcError::transient("binlog stream reset"));
            }
        }
        self.cursor = event.offset().clone();
        Ok(Some(event))
    }
}

#[async_trait]
impl TableSchemaProvider for MemoryDatabase {
    async fn list_tables(&self) -> Result<Vec<TableId>> {
        Ok(self.lock().tables.keys().cloned().collect())
    }

    async fn describe(&self, table_id: &TableId) -> Result<TableSchema> {
        self.lock()
            .tables
            .get(table_id)
            .map(|t| t.schema.clone())
            .ok_or_else(|| CdcError::config(format!("unknown table {table_id}")))
    }
}

/// Sink that collects emitted events for assertions.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

/// In-memory checkpoint store with monotonically increasing ids.
#[derive(Default)]
pub struct MemoryCheckpointer {
    next_id: AtomicU64,
    stored: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self) -> Vec<(u64, Vec<u8>)> {
        self.stored.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    fn next_checkpoint_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn store(&self, checkpoint_id: u64, state: Vec<u8>) -> Result<()> {
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((checkpoint_id, state));
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|(_, state)| state.clone()))
    }
}

/// Helper for tests: extract a single integer key.
pub fn int_key(v: i64) -> ChunkKey {
    ChunkKey::single(KeyValue::Int(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};
    use crate::split::KeyRange;
    use serde_json::json;

    fn products() -> TableId {
        TableId::new("shop", "products")
    }

    fn setup() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(TableSchema::new(
            products(),
            vec![
                ColumnSchema::new("id", ColumnType::Integer),
                ColumnSchema::new("name", ColumnType::Text).nullable(),
            ],
            vec!["id".into()],
        ));
        db
    }

    #[tokio::test]
    async fn test_offsets_advance_per_mutation() {
        let db = setup();
        let first = db.insert(&products(), json!({"id": 1}));
        let second = db.insert(&products(), json!({"id": 2}));
        assert!(first.is_before(&second).unwrap());
        assert_eq!(db.current_offset().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_key_span_and_boundaries() {
        let db = setup();
        db.seed(&products(), (1..=9).map(|i| json!({"id": i})));
        let cols = vec!["id".to_string()];

        let (min, max) = db.key_span(&products(), &cols).await.unwrap().unwrap();
        assert_eq!(min, int_key(1));
        assert_eq!(max, int_key(9));
        assert_eq!(db.estimated_row_count(&products()).await.unwrap(), 9);

        // Skip 4 rows past nothing: boundary is the 5th key.
        let boundary = db
            .next_chunk_boundary(&products(), &cols, None, 4)
            .await
            .unwrap();
        assert_eq!(boundary, Some(int_key(5)));

        // Fewer than 4 rows remain past 5: exhausted.
        let boundary = db
            .next_chunk_boundary(&products(), &cols, Some(&int_key(5)), 4)
            .await
            .unwrap();
        assert_eq!(boundary, Some(int_key(9)));
        let boundary = db
            .next_chunk_boundary(&products(), &cols, Some(&int_key(9)), 4)
            .await
            .unwrap();
        assert_eq!(boundary, None);
    }

    #[tokio::test]
    async fn test_scan_range_is_ordered_and_bounded() {
        let db = setup();
        db.seed(&products(), [9, 2, 5, 7].iter().map(|i| json!({"id": i})));
        let schema = db.describe(&products()).await.unwrap();
        let split = SnapshotSplit::new(
            products(),
            0,
            KeyRange::new(Some(int_key(3)), Some(int_key(8))),
            schema,
        )
        .unwrap();
        let rows = db.scan_range(&split).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![5, 7]);
    }

    #[tokio::test]
    async fn test_stream_is_exclusive_of_start() {
        let db = setup();
        let start = db.current_offset().await.unwrap();
        let first = db.insert(&products(), json!({"id": 1}));
        db.insert(&products(), json!({"id": 2}));

        let mut stream = db.stream_binlog(&start).await.unwrap();
        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.offset(), &first);
        stream.next_event().await.unwrap().unwrap();
        assert!(stream.next_event().await.unwrap().is_none());

        // Streaming from `first` skips the event at `first`.
        let mut stream = db.stream_binlog(&first).await.unwrap();
        let event = stream.next_event().await.unwrap().unwrap();
        assert!(event.offset().is_after(&first).unwrap());
    }

    #[tokio::test]
    async fn test_rotation_keeps_offsets_ordered() {
        let db = setup();
        let before = db.insert(&products(), json!({"id": 1}));
        db.rotate_log();
        let after = db.insert(&products(), json!({"id": 2}));

        assert_eq!(after.filename, "mysql-bin.000002");
        assert!(before.is_before(&after).unwrap());

        let mut stream = db.stream_binlog(&before).await.unwrap();
        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.offset(), &after);
    }

    #[tokio::test]
    async fn test_purged_history_is_lost() {
        let db = setup();
        let early = db.insert(&products(), json!({"id": 1}));
        let later = db.insert(&products(), json!({"id": 2}));
        db.purge_binlog_before(later.clone());

        let err = db.stream_binlog(&early).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, CdcError::BinlogPositionLost(_)));
        assert!(db.stream_binlog(&later).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let db = setup();
        db.seed(&products(), [json!({"id": 1})]);
        db.inject_scan_faults(1);
        let schema = db.describe(&products()).await.unwrap();
        let split = SnapshotSplit::new(products(), 0, KeyRange::full(), schema).unwrap();
        assert!(db.scan_range(&split).await.unwrap_err().is_retriable());
        assert_eq!(db.scan_range(&split).await.unwrap().len(), 1);
    }
}
