//! Binlog split reader: streams the binlog and filters out everything the
//! snapshot phase already emitted.
//!
//! The filter is the heart of exactly-once across the snapshot/binlog
//! boundary. A row event is emitted when its offset is past the high
//! watermark of the finished snapshot split whose key range contains the
//! row; it is dropped when the offset is at or before that watermark,
//! because the normalized batch of that split already represents it. A
//! per-table maximum high watermark short-circuits the range search once
//! a table's frontier is passed. Schema-change events are forwarded
//! unconditionally; heartbeats advance the resume cursor without being
//! emitted.

use crate::connection::{BinlogEvent, EventSink, SqlConnection};
use crate::error::{CdcError, Result};
use crate::event::ChangeEvent;
use crate::offset::BinlogOffset;
use crate::resilience::{ExponentialBackoff, RetryPolicy};
use crate::schema::TableId;
use crate::split::{BinlogSplit, FinishedSnapshotSplitInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

/// Per-table dedup state precomputed from the binlog split.
pub struct BinlogSplitFilter {
    finished_by_table: HashMap<TableId, Vec<FinishedSnapshotSplitInfo>>,
    /// Per table: the maximum high watermark across its finished splits,
    /// or the split's start offset in pure binlog mode.
    max_high_watermark: HashMap<TableId, BinlogOffset>,
    chunk_columns: HashMap<TableId, Vec<String>>,
}

impl BinlogSplitFilter {
    pub fn new(split: &BinlogSplit) -> Result<Self> {
        let mut chunk_columns = HashMap::new();
        let mut max_high_watermark = HashMap::new();
        for schema in &split.table_schemas {
            chunk_columns.insert(
                schema.table_id.clone(),
                schema.chunk_key_columns()?.to_vec(),
            );
            // Baseline for pure binlog mode; overwritten below when the
            // table has finished snapshot splits.
            max_high_watermark.insert(schema.table_id.clone(), split.start_offset.clone());
        }

        let mut finished_by_table: HashMap<TableId, Vec<FinishedSnapshotSplitInfo>> =
            HashMap::new();
        for info in &split.finished_snapshot_splits {
            let entry = max_high_watermark
                .entry(info.table_id.clone())
                .or_insert_with(|| info.high_watermark.clone());
            // Keep the larger watermark. The per-table frontier must be
            // the maximum, otherwise the fast path below would re-emit
            // rows already covered by later-finishing splits.
            if entry.is_before(&info.high_watermark)? {
                *entry = info.high_watermark.clone();
            }
            finished_by_table
                .entry(info.table_id.clone())
                .or_default()
                .push(info.clone());
        }

        Ok(Self {
            finished_by_table,
            max_high_watermark,
            chunk_columns,
        })
    }

    /// The per-table frontier, for tests and diagnostics.
    pub fn max_high_watermark(&self, table_id: &TableId) -> Option<&BinlogOffset> {
        self.max_high_watermark.get(table_id)
    }

    /// Decide whether a binlog event reaches the sink.
    ///
    /// Deterministic in the event and the finished-split set: re-running
    /// the decision always yields the same answer.
    pub fn should_emit(&self, event: &BinlogEvent) -> Result<bool> {
        let row = match event {
            // Schema changes and other non-data events always pass:
            // downstream state needs them.
            BinlogEvent::Row(row) => row,
            _ => return Ok(true),
        };

        let Some(frontier) = self.max_high_watermark.get(&row.table_id) else {
            trace!(table = %row.table_id, "event for uncaptured table dropped");
            return Ok(false);
        };
        // Fast path: past every snapshot split of this table.
        if row.offset.is_after(frontier)? {
            return Ok(true);
        }

        let columns = self
            .chunk_columns
            .get(&row.table_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let Some(key) = row.chunk_key(columns) else {
            return Ok(false);
        };
        if let Some(infos) = self.finished_by_table.get(&row.table_id) {
            for info in infos {
                if info.range.contains(&key) {
                    // Precise case: emitted only past this split's own
                    // high watermark; at-or-before is already in its
                    // normalized batch.
                    return row.offset.is_after(&info.high_watermark);
                }
            }
        }
        warn!(
            table = %row.table_id,
            key = %key,
            offset = %row.offset,
            "UnmappedKey: row outside the planned keyspace dropped"
        );
        Ok(false)
    }
}

/// Streams the binlog split, emitting filtered events to a sink.
pub struct BinlogSplitReader<C: SqlConnection> {
    conn: C,
    split: BinlogSplit,
    filter: BinlogSplitFilter,
    retry: RetryPolicy,
}

impl<C: SqlConnection> BinlogSplitReader<C> {
    pub fn new(conn: C, split: BinlogSplit, retry: RetryPolicy) -> Result<Self> {
        let filter = BinlogSplitFilter::new(&split)?;
        Ok(Self {
            conn,
            split,
            filter,
            retry,
        })
    }

    pub fn split(&self) -> &BinlogSplit {
        &self.split
    }

    /// Stream from the split's starting offset until the stop offset, the
    /// end of the stream, or cancellation. Returns the last processed
    /// offset.
    ///
    /// Transient disconnects reconnect and resume from the last processed
    /// offset; a pruned start position surfaces as fatal
    /// [`CdcError::BinlogPositionLost`].
    pub async fn run<S: EventSink>(
        &mut self,
        sink: &S,
        running: &AtomicBool,
    ) -> Result<BinlogOffset> {
        let mut cursor = self.split.starting_offset()?;
        let stop = self.split.stop_offset.clone();
        let mut backoff = ExponentialBackoff::new(self.retry.backoff_base, self.retry.backoff_max);
        info!(start = %cursor, stop = %stop, "binlog reader starting");

        'reconnect: while running.load(Ordering::Relaxed) {
            let mut stream = match self.conn.stream_binlog(&cursor).await {
                Ok(stream) => stream,
                Err(err) if err.is_retriable() && backoff.attempt() < self.retry.max_retries => {
                    sleep(backoff.next_backoff()).await;
                    continue 'reconnect;
                }
                Err(err) => return Err(err),
            };

            loop {
                if !running.load(Ordering::Relaxed) {
                    debug!(cursor = %cursor, "binlog reader cancelled");
                    return Ok(cursor);
                }
                match stream.next_event().await {
                    Ok(Some(event)) => {
                        backoff.reset();
                        let offset = event.offset().clone();
                        if !stop.is_no_stopping() && offset.is_after(&stop)? {
                            info!(stop = %stop, "binlog reader reached stop offset");
                            return Ok(cursor);
                        }
                        if self.filter.should_emit(&event)? {
                            self.emit(event, sink).await?;
                        }
                        cursor = offset;
                    }
                    Ok(None) => {
                        info!(cursor = %cursor, "binlog stream closed");
                        return Ok(cursor);
                    }
                    Err(err)
                        if err.is_retriable() && backoff.attempt() < self.retry.max_retries =>
                    {
                        let delay = backoff.next_backoff();
                        debug!(
                            cursor = %cursor,
                            error = %err,
                            "binlog stream dropped, reconnecting"
                        );
                        sleep(delay).await;
                        continue 'reconnect;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(cursor)
    }

    async fn emit<S: EventSink>(&self, event: BinlogEvent, sink: &S) -> Result<()> {
        match event {
            BinlogEvent::Row(row) => {
                for change in row.into_change_events() {
                    sink.emit(change).await?;
                }
            }
            BinlogEvent::SchemaChange {
                table_id,
                offset,
                ddl,
            } => {
                sink.emit(ChangeEvent::schema_change(table_id, offset, ddl))
                    .await?;
            }
            // Heartbeats only advance the resume cursor.
            BinlogEvent::Heartbeat { .. } => {}
        }
        Ok(())
    }
}
