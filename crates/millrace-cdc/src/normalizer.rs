//! Record normalizer: reconciles a split's raw scan with its replayed
//! binlog slice.
//!
//! The raw stream of one snapshot split is
//! `[LOW(L)] [scan rows…] [HIGH(H)] [replay events…] [BINLOG_END(H)]`.
//! Folding it into a map keyed by primary key yields the table state of
//! the split's key range as of `H`: scan rows seed the map, replayed
//! inserts and update after-images overwrite, replayed deletes remove.
//! After this fold the split behaves as if it had been a single
//! transactional snapshot taken at `H`.

use crate::connection::{RowEvent, RowOp};
use crate::error::{CdcError, Result};
use crate::event::{ChangeEvent, SourceMeta};
use crate::offset::BinlogOffset;
use crate::split::{ChunkKey, SnapshotSplit};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// One element of a snapshot split's raw stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitEvent {
    LowWatermark(BinlogOffset),
    /// A row from the range scan.
    SnapshotRow(serde_json::Value),
    HighWatermark(BinlogOffset),
    /// A row change replayed from the bounded binlog slice.
    Replay(RowEvent),
    BinlogEnd(BinlogOffset),
}

/// Fold a split's raw stream into its normalized batch.
///
/// The output is a flat set of INSERT events representing the range's
/// contents at the high watermark, in key order. Out-of-range keys are
/// dropped, replay offsets below the low watermark are ignored.
pub fn normalize(split: &SnapshotSplit, events: Vec<SplitEvent>) -> Result<Vec<ChangeEvent>> {
    let key_columns: &[String] = if split.schema.primary_key.is_empty() {
        &split.chunk_key_columns
    } else {
        &split.schema.primary_key
    };

    let mut low: Option<BinlogOffset> = None;
    let mut high: Option<BinlogOffset> = None;
    let mut state: BTreeMap<ChunkKey, serde_json::Value> = BTreeMap::new();
    let mut dropped_out_of_range = 0u64;
    let mut replayed = 0u64;

    for event in events {
        match event {
            SplitEvent::LowWatermark(offset) => {
                if low.is_some() {
                    return Err(CdcError::invalid_state("duplicate low watermark"));
                }
                low = Some(offset);
            }
            SplitEvent::SnapshotRow(row) => {
                if low.is_none() {
                    return Err(CdcError::invalid_state("snapshot row before low watermark"));
                }
                let chunk_key = ChunkKey::from_row(&row, &split.chunk_key_columns);
                if !split.range.contains(&chunk_key) {
                    dropped_out_of_range += 1;
                    continue;
                }
                state.insert(ChunkKey::from_row(&row, key_columns), row);
            }
            SplitEvent::HighWatermark(offset) => {
                if low.is_none() {
                    return Err(CdcError::invalid_state("high watermark before low watermark"));
                }
                if high.is_some() {
                    return Err(CdcError::invalid_state("duplicate high watermark"));
                }
                high = Some(offset);
            }
            SplitEvent::Replay(row_event) => {
                let Some(low) = &low else {
                    return Err(CdcError::invalid_state("replay before low watermark"));
                };
                if high.is_none() {
                    return Err(CdcError::invalid_state("replay before high watermark"));
                }
                if row_event.offset.is_before(low)? {
                    // Should not occur: the reader opens the stream at L.
                    trace!(offset = %row_event.offset, "replay event below low watermark ignored");
                    continue;
                }
                let Some(chunk_key) = row_event.chunk_key(&split.chunk_key_columns) else {
                    continue;
                };
                if !split.range.contains(&chunk_key) {
                    dropped_out_of_range += 1;
                    continue;
                }
                replayed += 1;
                match row_event.op {
                    RowOp::Insert | RowOp::Update => {
                        // The after-image wins; whatever the scan held for
                        // this key is stale.
                        if let Some(after) = row_event.after {
                            state.insert(ChunkKey::from_row(&after, key_columns), after);
                        }
                    }
                    RowOp::Delete => {
                        if let Some(before) = row_event.before {
                            state.remove(&ChunkKey::from_row(&before, key_columns));
                        }
                    }
                }
            }
            SplitEvent::BinlogEnd(_) => break,
        }
    }

    let high = high.ok_or_else(|| CdcError::invalid_state("stream ended without high watermark"))?;
    debug!(
        split_id = %split.split_id,
        rows = state.len(),
        replayed,
        dropped_out_of_range,
        high_watermark = %high,
        "split normalized"
    );

    Ok(state
        .into_values()
        .map(|row| {
            ChangeEvent::insert(
                split.table_id.clone(),
                high.clone(),
                row,
                SourceMeta::snapshot(),
            )
        })
        .collect())
}
