//! Chunk splitter: partitions a table's keyspace into snapshot splits.
//!
//! The splitter is lazy — one split per call — and resumable: its cursor
//! (last handed-out boundary plus sequence number) is part of the assigner
//! checkpoint state. Splits always tile the keyspace: the first range is
//! open at -inf, each range starts where the previous one ended, and the
//! final range is open at +inf, so the union is a partition no matter
//! which planning strategy produced the boundaries.
//!
//! Two strategies, picked per table after probing:
//! - evenly-spaced numeric ranges, when the table has a single integer
//!   chunk key whose values are spread roughly uniformly;
//! - a boundary walk issuing `LIMIT` probes, for everything else.
//!
//! Chunk keys are assumed unique; duplicate key values would straddle a
//! boundary.

use crate::connection::SqlConnection;
use crate::error::{CdcError, Result};
use crate::schema::{TableId, TableSchema};
use crate::split::{ChunkKey, KeyRange, KeyValue, SnapshotSplit};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Upper bound on `(max - min + 1) / row_count` for the evenly-spaced
/// strategy; sparser keys fall back to the boundary walk.
const DISTRIBUTION_FACTOR_UPPER: f64 = 1000.0;
/// Lower bound guarding against heavily duplicated keys.
const DISTRIBUTION_FACTOR_LOWER: f64 = 0.05;

/// Resumable splitter position, persisted in assigner state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCursor {
    pub table_id: TableId,
    /// Sequence number of the next split to hand out.
    pub next_sequence: u64,
    /// End boundary of the last handed-out split; `None` before the first.
    pub last_boundary: Option<ChunkKey>,
    pub exhausted: bool,
}

impl ChunkCursor {
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            next_sequence: 0,
            last_boundary: None,
            exhausted: false,
        }
    }
}

/// Planning strategy, decided on first use from table statistics.
#[derive(Debug, Clone)]
enum ChunkPlan {
    /// Table fits in one chunk.
    SingleFull,
    /// Evenly-spaced numeric boundaries.
    Even {
        min: i128,
        max: i128,
        step: i128,
        unsigned: bool,
    },
    /// Boundary walk via `LIMIT` probes.
    Walk,
}

/// Produces the snapshot splits of one table, lazily.
pub struct ChunkSplitter<C: SqlConnection> {
    conn: C,
    schema: TableSchema,
    chunk_key_columns: Vec<String>,
    chunk_size: u64,
    cursor: ChunkCursor,
    plan: Option<ChunkPlan>,
}

impl<C: SqlConnection> ChunkSplitter<C> {
    pub fn new(conn: C, schema: TableSchema, chunk_size: u64) -> Result<Self> {
        let cursor = ChunkCursor::new(schema.table_id.clone());
        Self::resume(conn, schema, chunk_size, cursor)
    }

    /// Resume from a checkpointed cursor.
    pub fn resume(
        conn: C,
        schema: TableSchema,
        chunk_size: u64,
        cursor: ChunkCursor,
    ) -> Result<Self> {
        let chunk_key_columns = schema.chunk_key_columns()?.to_vec();
        Ok(Self {
            conn,
            schema,
            chunk_key_columns,
            chunk_size: chunk_size.max(1),
            cursor,
            plan: None,
        })
    }

    pub fn table_id(&self) -> &TableId {
        &self.cursor.table_id
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.exhausted
    }

    /// Current cursor, for checkpointing.
    pub fn cursor(&self) -> &ChunkCursor {
        &self.cursor
    }

    /// The next split, or `None` once the keyspace is tiled.
    pub async fn next_split(&mut self) -> Result<Option<SnapshotSplit>> {
        if self.cursor.exhausted {
            return Ok(None);
        }
        if self.plan.is_none() {
            let plan = self.decide_plan().await?;
            debug!(table = %self.cursor.table_id, plan = ?plan, "chunk plan decided");
            self.plan = Some(plan);
        }

        let end = match self.plan.as_ref().expect("plan decided") {
            ChunkPlan::SingleFull => None,
            ChunkPlan::Even {
                min,
                max,
                step,
                unsigned,
            } => {
                let previous = match &self.cursor.last_boundary {
                    None => *min,
                    Some(key) => single_numeric(key).ok_or_else(|| {
                        CdcError::invalid_state(format!(
                            "non-numeric cursor boundary {key} for evenly-split table"
                        ))
                    })?,
                };
                let next = previous.saturating_add(*step);
                if next > *max {
                    None
                } else {
                    Some(ChunkKey::single(numeric_key(next, *unsigned)))
                }
            }
            ChunkPlan::Walk => {
                let boundary = self
                    .conn
                    .next_chunk_boundary(
                        &self.cursor.table_id,
                        &self.chunk_key_columns,
                        self.cursor.last_boundary.as_ref(),
                        self.chunk_size,
                    )
                    .await?;
                match boundary {
                    Some(b) if Some(&b) <= self.cursor.last_boundary.as_ref() => {
                        // Non-advancing boundary: duplicate key values.
                        // Close out with a final open range.
                        warn!(
                            table = %self.cursor.table_id,
                            boundary = %b,
                            "chunk boundary did not advance; emitting final open split"
                        );
                        None
                    }
                    other => other,
                }
            }
        };

        let range = KeyRange::new(self.cursor.last_boundary.clone(), end.clone());
        let split = SnapshotSplit::new(
            self.cursor.table_id.clone(),
            self.cursor.next_sequence,
            range,
            self.schema.clone(),
        )?;
        self.cursor.next_sequence += 1;
        match end {
            Some(boundary) => self.cursor.last_boundary = Some(boundary),
            None => self.cursor.exhausted = true,
        }
        Ok(Some(split))
    }

    async fn decide_plan(&self) -> Result<ChunkPlan> {
        let table_id = &self.cursor.table_id;
        let span = self
            .conn
            .key_span(table_id, &self.chunk_key_columns)
            .await?;
        let Some((min, max)) = span else {
            return Ok(ChunkPlan::SingleFull);
        };
        let row_count = self.conn.estimated_row_count(table_id).await?;
        if row_count <= self.chunk_size {
            return Ok(ChunkPlan::SingleFull);
        }

        if self.chunk_key_columns.len() == 1 {
            let splittable = self
                .schema
                .column(&self.chunk_key_columns[0])
                .map(|c| c.column_type.is_evenly_splittable())
                .unwrap_or(false);
            if splittable {
                if let (Some(lo), Some(hi)) = (single_numeric(&min), single_numeric(&max)) {
                    let factor = (hi - lo + 1) as f64 / row_count as f64;
                    if (DISTRIBUTION_FACTOR_LOWER..=DISTRIBUTION_FACTOR_UPPER).contains(&factor) {
                        // Dynamic step keeps roughly chunk_size rows per
                        // range for the observed density.
                        let step = ((self.chunk_size as f64 * factor) as i128).max(1);
                        let unsigned = matches!(min.0.first(), Some(KeyValue::UInt(_)));
                        return Ok(ChunkPlan::Even {
                            min: lo,
                            max: hi,
                            step,
                            unsigned,
                        });
                    }
                    debug!(
                        table = %table_id,
                        factor,
                        "key distribution outside bounds, walking boundaries"
                    );
                }
            }
        }
        Ok(ChunkPlan::Walk)
    }
}

fn single_numeric(key: &ChunkKey) -> Option<i128> {
    match key.0.as_slice() {
        [value] => numeric_single(value),
        _ => None,
    }
}

fn numeric_single(value: &KeyValue) -> Option<i128> {
    match value {
        KeyValue::Int(i) => Some(*i as i128),
        KeyValue::UInt(u) => Some(*u as i128),
        _ => None,
    }
}

fn numeric_key(value: i128, unsigned: bool) -> KeyValue {
    if unsigned {
        KeyValue::UInt(value.clamp(0, u64::MAX as i128) as u64)
    } else {
        KeyValue::Int(value.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }
}

/// `SELECT` text for the min-key probe, for driver adapters.
pub fn min_key_sql(table_id: &TableId, columns: &[String]) -> String {
    let keys = columns.join(", ");
    format!("SELECT {keys} FROM {table_id} ORDER BY {keys} ASC LIMIT 1")
}

/// `SELECT` text for the max-key probe, for driver adapters.
pub fn max_key_sql(table_id: &TableId, columns: &[String]) -> String {
    let keys = columns.join(", ");
    let desc = columns
        .iter()
        .map(|c| format!("{c} DESC"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {keys} FROM {table_id} ORDER BY {desc} LIMIT 1")
}

/// `SELECT` text for the boundary-walk probe, for driver adapters.
pub fn boundary_sql(
    table_id: &TableId,
    columns: &[String],
    after: Option<&ChunkKey>,
    chunk_size: u64,
) -> String {
    let keys = columns.join(", ");
    let mut sql = format!("SELECT {keys} FROM {table_id} ");
    if let Some(after) = after {
        let literals = after
            .0
            .iter()
            .map(KeyValue::to_sql_literal)
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!("WHERE ({keys}) >= ({literals}) "));
    }
    sql.push_str(&format!("ORDER BY {keys} LIMIT {chunk_size}, 1"));
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{int_key, MemoryDatabase};
    use crate::schema::{ColumnSchema, ColumnType, TableSchemaProvider};
    use serde_json::json;

    fn products() -> TableId {
        TableId::new("shop", "products")
    }

    async fn setup(ids: impl IntoIterator<Item = i64>) -> (MemoryDatabase, TableSchema) {
        let db = MemoryDatabase::new();
        db.create_table(TableSchema::new(
            products(),
            vec![
                ColumnSchema::new("id", ColumnType::Integer),
                ColumnSchema::new("name", ColumnType::Text).nullable(),
            ],
            vec!["id".into()],
        ));
        db.seed(&products(), ids.into_iter().map(|i| json!({"id": i})));
        let schema = db.describe(&products()).await.unwrap();
        (db, schema)
    }

    async fn collect_splits<C: SqlConnection>(
        splitter: &mut ChunkSplitter<C>,
    ) -> Vec<SnapshotSplit> {
        let mut out = Vec::new();
        while let Some(split) = splitter.next_split().await.unwrap() {
            out.push(split);
        }
        out
    }

    fn ranges(splits: &[SnapshotSplit]) -> Vec<(Option<ChunkKey>, Option<ChunkKey>)> {
        splits
            .iter()
            .map(|s| (s.range.start.clone(), s.range.end.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_nine_rows_chunk_four() {
        let (db, schema) = setup(1..=9).await;
        let mut splitter = ChunkSplitter::new(db, schema, 4).unwrap();
        let splits = collect_splits(&mut splitter).await;

        assert_eq!(
            ranges(&splits),
            vec![
                (None, Some(int_key(5))),
                (Some(int_key(5)), Some(int_key(9))),
                (Some(int_key(9)), None),
            ]
        );
        assert_eq!(splits[0].split_id, "shop.products:0");
        assert_eq!(splits[2].split_id, "shop.products:2");
        assert!(splitter.is_exhausted());
        assert!(splitter.next_split().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_small_table_single_full_split() {
        let (db, schema) = setup(1..=3).await;
        let mut splitter = ChunkSplitter::new(db, schema, 10).unwrap();
        let splits = collect_splits(&mut splitter).await;
        assert_eq!(splits.len(), 1);
        assert!(splits[0].range.is_full());
    }

    #[tokio::test]
    async fn test_empty_table_single_full_split() {
        let (db, schema) = setup([]).await;
        let mut splitter = ChunkSplitter::new(db, schema, 10).unwrap();
        let splits = collect_splits(&mut splitter).await;
        assert_eq!(splits.len(), 1);
        assert!(splits[0].range.is_full());
    }

    #[tokio::test]
    async fn test_even_plan_for_dense_keys() {
        let (db, schema) = setup(1..=100).await;
        let mut splitter = ChunkSplitter::new(db, schema, 25).unwrap();
        let splits = collect_splits(&mut splitter).await;
        assert_eq!(
            ranges(&splits),
            vec![
                (None, Some(int_key(26))),
                (Some(int_key(26)), Some(int_key(51))),
                (Some(int_key(51)), Some(int_key(76))),
                (Some(int_key(76)), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_sparse_keys_fall_back_to_walk() {
        // 8 rows spread over a billion-wide key range: factor way past the
        // upper bound, so boundaries come from probes, not arithmetic.
        let ids = [1i64, 2, 3, 5_000, 5_001, 900_000_000, 900_000_001, 900_000_002];
        let (db, schema) = setup(ids).await;
        let mut splitter = ChunkSplitter::new(db, schema, 3).unwrap();
        let splits = collect_splits(&mut splitter).await;
        assert_eq!(
            ranges(&splits),
            vec![
                (None, Some(int_key(5_000))),
                (Some(int_key(5_000)), Some(int_key(900_000_001))),
                (Some(int_key(900_000_001)), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_cursor_resume_continues_tiling() {
        let (db, schema) = setup(1..=9).await;
        let mut splitter = ChunkSplitter::new(db.clone(), schema.clone(), 4).unwrap();
        let first = splitter.next_split().await.unwrap().unwrap();
        assert_eq!(first.range.end, Some(int_key(5)));

        let cursor = splitter.cursor().clone();
        let json = serde_json::to_string(&cursor).unwrap();
        let restored: ChunkCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(cursor, restored);

        let mut resumed = ChunkSplitter::resume(db, schema, 4, restored).unwrap();
        let second = resumed.next_split().await.unwrap().unwrap();
        assert_eq!(second.range.start, Some(int_key(5)));
        assert_eq!(second.split_id, "shop.products:1");
    }

    #[test]
    fn test_probe_sql_text() {
        let cols = vec!["id".to_string()];
        assert_eq!(
            min_key_sql(&products(), &cols),
            "SELECT id FROM shop.products ORDER BY id ASC LIMIT 1"
        );
        assert_eq!(
            max_key_sql(&products(), &cols),
            "SELECT id FROM shop.products ORDER BY id DESC LIMIT 1"
        );
        assert_eq!(
            boundary_sql(&products(), &cols, Some(&int_key(5)), 4),
            "SELECT id FROM shop.products WHERE (id) >= (5) ORDER BY id LIMIT 4, 1"
        );
        assert_eq!(
            boundary_sql(&products(), &cols, None, 4),
            "SELECT id FROM shop.products ORDER BY id LIMIT 4, 1"
        );
    }
}
