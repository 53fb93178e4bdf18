//! Snapshot split reader: executes the watermark protocol for one split.
//!
//! Per split: read the low watermark, scan the key range, read the high
//! watermark, then replay the binlog slice between the two so the
//! normalized batch is point-in-time consistent at the high watermark.
//! When the watermarks are equal the replay is skipped entirely.
//!
//! Transient failures retry with exponential backoff up to the configured
//! cap; a connection loss mid-replay restarts the replay from the low
//! watermark (the partial slice is discarded, so the restart is exact).
//! Whatever escapes the retries surfaces as `SplitExecutionFailed` and
//! leaves the reader in the `Failed` phase; the assigner may then hand the
//! split out again from scratch.

use crate::connection::{BinlogEvent, SqlConnection};
use crate::error::{CdcError, Result};
use crate::event::ChangeEvent;
use crate::normalizer::{normalize, SplitEvent};
use crate::offset::BinlogOffset;
use crate::resilience::{ExponentialBackoff, RetryPolicy};
use crate::split::{FinishedSnapshotSplitInfo, SnapshotSplit};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Progress of the watermark protocol for the split being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    Init,
    LowWatermarkRead,
    Scanning,
    HighWatermarkRead,
    BinlogReplay,
    Done,
    Failed,
}

/// Executes snapshot splits against one connection.
pub struct SnapshotSplitReader<C: SqlConnection> {
    conn: C,
    retry: RetryPolicy,
    phase: SnapshotPhase,
}

impl<C: SqlConnection> SnapshotSplitReader<C> {
    pub fn new(conn: C, retry: RetryPolicy) -> Self {
        Self {
            conn,
            retry,
            phase: SnapshotPhase::Init,
        }
    }

    pub fn phase(&self) -> SnapshotPhase {
        self.phase
    }

    /// Run the watermark protocol for `split` and return its finish record
    /// plus the normalized batch.
    pub async fn execute(
        &mut self,
        split: &SnapshotSplit,
    ) -> Result<(FinishedSnapshotSplitInfo, Vec<ChangeEvent>)> {
        match self.run(split).await {
            Ok(result) => {
                self.phase = SnapshotPhase::Done;
                Ok(result)
            }
            Err(cause) => {
                self.phase = SnapshotPhase::Failed;
                warn!(split_id = %split.split_id, error = %cause, "snapshot split failed");
                Err(CdcError::split_failed(&split.split_id, cause))
            }
        }
    }

    async fn run(
        &mut self,
        split: &SnapshotSplit,
    ) -> Result<(FinishedSnapshotSplitInfo, Vec<ChangeEvent>)> {
        self.phase = SnapshotPhase::Init;
        let mut events = Vec::new();

        self.phase = SnapshotPhase::LowWatermarkRead;
        let low = self
            .retry
            .run("read low watermark", || self.conn.current_offset())
            .await?;
        events.push(SplitEvent::LowWatermark(low.clone()));

        self.phase = SnapshotPhase::Scanning;
        let rows = self
            .retry
            .run("scan split range", || self.conn.scan_range(split))
            .await?;
        let scanned = rows.len();
        events.extend(rows.into_iter().map(SplitEvent::SnapshotRow));

        self.phase = SnapshotPhase::HighWatermarkRead;
        let high = self
            .retry
            .run("read high watermark", || self.conn.current_offset())
            .await?;
        events.push(SplitEvent::HighWatermark(high.clone()));

        if high == low {
            debug!(
                split_id = %split.split_id,
                watermark = %high,
                "watermarks equal, skipping binlog replay"
            );
        } else {
            self.phase = SnapshotPhase::BinlogReplay;
            self.replay(split, &low, &high, &mut events).await?;
        }
        events.push(SplitEvent::BinlogEnd(high.clone()));

        let batch = normalize(split, events)?;
        info!(
            split_id = %split.split_id,
            range = %split.range,
            scanned,
            emitted = batch.len(),
            high_watermark = %high,
            "snapshot split finished"
        );
        Ok((split.finished(high), batch))
    }

    /// Replay the binlog slice between the watermarks, appending row
    /// changes for the split's table to `events`. Restarts from the low
    /// watermark when the stream drops mid-replay.
    async fn replay(
        &self,
        split: &SnapshotSplit,
        low: &BinlogOffset,
        high: &BinlogOffset,
        events: &mut Vec<SplitEvent>,
    ) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(self.retry.backoff_base, self.retry.backoff_max);
        let replay_mark = events.len();
        loop {
            events.truncate(replay_mark);
            match self.replay_once(split, low, high, events).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retriable() && backoff.attempt() < self.retry.max_retries => {
                    let delay = backoff.next_backoff();
                    debug!(
                        split_id = %split.split_id,
                        attempt = backoff.attempt(),
                        error = %err,
                        "replay interrupted, restarting from low watermark"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn replay_once(
        &self,
        split: &SnapshotSplit,
        low: &BinlogOffset,
        high: &BinlogOffset,
        events: &mut Vec<SplitEvent>,
    ) -> Result<()> {
        let mut stream = self.conn.stream_binlog(low).await?;
        while let Some(event) = stream.next_event().await? {
            let offset = event.offset().clone();
            if offset.is_after(high)? {
                break;
            }
            if let BinlogEvent::Row(row) = event {
                if row.table_id == split.table_id {
                    events.push(SplitEvent::Replay(row));
                }
            }
            // The event at the high watermark is the last one inside the
            // snapshot; everything later belongs to the binlog phase.
            if !offset.is_before(high)? {
                break;
            }
        }
        Ok(())
    }
}
