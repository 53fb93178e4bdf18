//! Split assigner: hands work to readers and drives the job's phase
//! machine.
//!
//! Phases: `Initial → DiscoveringTables → SnapshotAssigning →
//! SnapshotDraining → BinlogAssigned → Terminal`, with a direct jump to
//! `BinlogAssigned` when the job runs in binlog-only mode. The assigner
//! owns its state exclusively; callers interact through its serialized
//! API (the source wraps it in an owner task and message passing).
//!
//! The binlog split constructed at the snapshot/binlog transition carries
//! the complete finished-split list and the table schema snapshot; the
//! binlog reader needs both for deduplication.

use crate::chunk::ChunkSplitter;
use crate::config::{SourceConfig, StartupMode};
use crate::connection::SqlConnection;
use crate::error::{CdcError, Result};
use crate::offset::BinlogOffset;
use crate::schema::{TableSchema, TableSchemaProvider};
use crate::split::{BinlogSplit, FinishedSnapshotSplitInfo, SnapshotSplit, Split};
use crate::state::{AssignerPhase, AssignerState};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrates snapshot splits across workers and the transition to the
/// binlog phase.
pub struct SplitAssigner<C: SqlConnection + Clone> {
    conn: C,
    provider: Arc<dyn TableSchemaProvider>,
    config: SourceConfig,
    phase: AssignerPhase,
    schemas: Vec<TableSchema>,
    /// Splitter of the current table at the front; popped when exhausted.
    splitters: VecDeque<ChunkSplitter<C>>,
    /// Splits awaiting (re-)assignment.
    pending: VecDeque<SnapshotSplit>,
    /// Splits currently executing, with their worker.
    in_flight: Vec<(u32, SnapshotSplit)>,
    finished: Vec<FinishedSnapshotSplitInfo>,
    /// Failed-execution counts per split id. Not checkpointed; a restore
    /// starts the budget fresh.
    failure_counts: std::collections::HashMap<String, u32>,
    binlog_split: Option<BinlogSplit>,
    /// Worker holding the binlog split, once handed out.
    binlog_worker: Option<u32>,
}

impl<C: SqlConnection + Clone> SplitAssigner<C> {
    pub fn new(conn: C, provider: Arc<dyn TableSchemaProvider>, config: SourceConfig) -> Self {
        Self {
            conn,
            provider,
            config,
            phase: AssignerPhase::Initial,
            schemas: Vec::new(),
            splitters: VecDeque::new(),
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            finished: Vec::new(),
            failure_counts: std::collections::HashMap::new(),
            binlog_split: None,
            binlog_worker: None,
        }
    }

    /// Re-enter the phase captured in a checkpoint. In-flight splits are
    /// returned to the pending queue and rerun from scratch.
    pub fn restore(
        conn: C,
        provider: Arc<dyn TableSchemaProvider>,
        config: SourceConfig,
        state: AssignerState,
    ) -> Result<Self> {
        let mut pending: VecDeque<SnapshotSplit> = state.pending_splits.into();
        pending.extend(state.in_flight_splits);

        let mut splitters = VecDeque::new();
        for cursor in state.chunk_cursors {
            if cursor.exhausted {
                continue;
            }
            let schema = state
                .table_schemas
                .iter()
                .find(|s| s.table_id == cursor.table_id)
                .cloned()
                .ok_or_else(|| {
                    CdcError::invalid_state(format!(
                        "checkpoint cursor references unknown table {}",
                        cursor.table_id
                    ))
                })?;
            splitters.push_back(ChunkSplitter::resume(
                conn.clone(),
                schema,
                config.chunk_size,
                cursor,
            )?);
        }

        info!(
            phase = ?state.phase,
            pending = pending.len(),
            finished = state.finished_splits.len(),
            "assigner restored from checkpoint"
        );
        Ok(Self {
            conn,
            provider,
            config,
            phase: state.phase,
            schemas: state.table_schemas,
            splitters,
            pending,
            in_flight: Vec::new(),
            finished: state.finished_splits,
            failure_counts: std::collections::HashMap::new(),
            binlog_split: state.binlog_split,
            binlog_worker: None,
        })
    }

    pub fn phase(&self) -> AssignerPhase {
        self.phase
    }

    pub fn finished_splits(&self) -> &[FinishedSnapshotSplitInfo] {
        &self.finished
    }

    /// Minimum high watermark across finished splits.
    pub fn min_high_watermark(&self) -> Result<Option<BinlogOffset>> {
        self.fold_watermark(|acc, hw| acc.min(hw))
    }

    /// Maximum high watermark across finished splits.
    pub fn max_high_watermark(&self) -> Result<Option<BinlogOffset>> {
        self.fold_watermark(|acc, hw| acc.max(hw))
    }

    fn fold_watermark(
        &self,
        pick: impl Fn(BinlogOffset, BinlogOffset) -> Result<BinlogOffset>,
    ) -> Result<Option<BinlogOffset>> {
        let mut acc: Option<BinlogOffset> = None;
        for info in &self.finished {
            acc = Some(match acc {
                None => info.high_watermark.clone(),
                Some(current) => pick(current, info.high_watermark.clone())?,
            });
        }
        Ok(acc)
    }

    /// Discover captured tables and enter the first assigning phase.
    pub async fn open(&mut self) -> Result<()> {
        if !matches!(
            self.phase,
            AssignerPhase::Initial | AssignerPhase::DiscoveringTables
        ) {
            // Restored past discovery; nothing to do.
            return Ok(());
        }
        self.phase = AssignerPhase::DiscoveringTables;
        let filters = self.config.filters()?;
        let mut captured = Vec::new();
        for table_id in self.provider.list_tables().await? {
            if filters.matches(&table_id) {
                captured.push(table_id);
            } else {
                debug!(table = %table_id, "filtered out of capture");
            }
        }
        if captured.is_empty() {
            return Err(CdcError::config(
                "no tables match the configured database/table filters",
            ));
        }

        for table_id in &captured {
            let schema = self.provider.describe(table_id).await?;
            schema.validate()?;
            // Refuse tables without a usable chunk key up front.
            schema.chunk_key_columns()?;
            self.schemas.push(schema);
        }
        info!(tables = captured.len(), "table discovery complete");

        if self.config.snapshot_enabled() {
            for schema in &self.schemas {
                self.splitters.push_back(ChunkSplitter::new(
                    self.conn.clone(),
                    schema.clone(),
                    self.config.chunk_size,
                )?);
            }
            self.phase = AssignerPhase::SnapshotAssigning;
        } else {
            let start = self.resolve_startup_offset().await?;
            self.binlog_split = Some(self.build_binlog_split(start)?);
            self.phase = AssignerPhase::BinlogAssigned;
            info!("binlog-only mode, skipping snapshot phase");
        }
        Ok(())
    }

    /// Hand the next split to a worker. Non-blocking: `None` means no
    /// split is ready right now (or ever, in `Terminal`).
    pub async fn next_split(&mut self, worker_id: u32) -> Result<Option<Split>> {
        loop {
            if matches!(
                self.phase,
                AssignerPhase::SnapshotAssigning | AssignerPhase::SnapshotDraining
            ) {
                if let Some(split) = self.pending.pop_front() {
                    return Ok(Some(self.assign(worker_id, split)));
                }
            }
            match self.phase {
                AssignerPhase::SnapshotAssigning => {
                    let Some(splitter) = self.splitters.front_mut() else {
                        if self.in_flight.is_empty() {
                            self.maybe_finish_snapshot_phase().await?;
                            if self.phase == AssignerPhase::SnapshotAssigning {
                                return Ok(None);
                            }
                            continue;
                        }
                        self.phase = AssignerPhase::SnapshotDraining;
                        debug!("chunks exhausted, draining in-flight splits");
                        return Ok(None);
                    };
                    match splitter.next_split().await? {
                        Some(split) => return Ok(Some(self.assign(worker_id, split))),
                        None => {
                            self.splitters.pop_front();
                        }
                    }
                }
                AssignerPhase::SnapshotDraining => return Ok(None),
                AssignerPhase::BinlogAssigned => {
                    if self.binlog_worker.is_some() {
                        return Ok(None);
                    }
                    let split = self
                        .binlog_split
                        .clone()
                        .ok_or_else(|| CdcError::invalid_state("binlog phase without split"))?;
                    self.binlog_worker = Some(worker_id);
                    info!(worker = worker_id, start = %split.start_offset, "binlog split assigned");
                    return Ok(Some(Split::Binlog(split)));
                }
                AssignerPhase::Initial
                | AssignerPhase::DiscoveringTables
                | AssignerPhase::Terminal => return Ok(None),
            }
        }
    }

    fn assign(&mut self, worker_id: u32, split: SnapshotSplit) -> Split {
        debug!(worker = worker_id, split_id = %split.split_id, range = %split.range, "split assigned");
        self.in_flight.push((worker_id, split.clone()));
        Split::Snapshot(split)
    }

    /// Record a finished snapshot split and advance the phase machine.
    pub async fn on_split_finished(&mut self, info: FinishedSnapshotSplitInfo) -> Result<()> {
        let before = self.in_flight.len();
        self.in_flight.retain(|(_, s)| s.split_id != info.split_id);
        if self.in_flight.len() == before {
            warn!(split_id = %info.split_id, "finish report for unassigned split");
        }
        debug!(
            split_id = %info.split_id,
            high_watermark = %info.high_watermark,
            "snapshot split finished"
        );
        self.finished.push(info);
        self.maybe_finish_snapshot_phase().await
    }

    /// Record a failed split execution. Returns `true` when the split was
    /// returned to the queue for another run, `false` when its retry
    /// budget is exhausted and the failure must escalate.
    pub fn on_split_failed(&mut self, worker_id: u32, split_id: &str) -> bool {
        let attempts = self
            .failure_counts
            .entry(split_id.to_string())
            .or_insert(0);
        *attempts += 1;
        let position = self
            .in_flight
            .iter()
            .position(|(worker, s)| *worker == worker_id && s.split_id == split_id);
        let Some(position) = position else {
            warn!(split_id, worker = worker_id, "failure report for unassigned split");
            return false;
        };
        let (_, split) = self.in_flight.remove(position);
        if *attempts > self.config.max_split_retries {
            warn!(
                split_id,
                attempts = *attempts,
                "split retry budget exhausted, escalating"
            );
            return false;
        }
        warn!(split_id, attempt = *attempts, "split failed, queued for rerun");
        self.pending.push_back(split);
        true
    }

    /// Advance the binlog split's resume position as the reader consumes
    /// the stream, so checkpoints restart where reading left off.
    pub fn on_binlog_progress(&mut self, offset: BinlogOffset) {
        if let Some(split) = &mut self.binlog_split {
            split.start_offset = offset;
        }
    }

    /// Return a failed worker's splits to the pending queue.
    pub fn on_worker_failure(&mut self, worker_id: u32) {
        let mut returned = 0;
        let mut kept = Vec::with_capacity(self.in_flight.len());
        for (worker, split) in self.in_flight.drain(..) {
            if worker == worker_id {
                self.pending.push_back(split);
                returned += 1;
            } else {
                kept.push((worker, split));
            }
        }
        self.in_flight = kept;
        if self.binlog_worker == Some(worker_id) {
            self.binlog_worker = None;
            returned += 1;
        }
        if returned > 0 {
            warn!(worker = worker_id, returned, "worker failed, splits returned to queue");
        }
    }

    /// Mark the job terminal (stop offset reached or cancellation).
    pub fn close(&mut self) {
        self.phase = AssignerPhase::Terminal;
    }

    /// Serializable state for the external checkpointer.
    pub fn snapshot_state(&self) -> AssignerState {
        AssignerState {
            phase: self.phase,
            table_schemas: self.schemas.clone(),
            chunk_cursors: self.splitters.iter().map(|s| s.cursor().clone()).collect(),
            pending_splits: self.pending.iter().cloned().collect(),
            in_flight_splits: self.in_flight.iter().map(|(_, s)| s.clone()).collect(),
            finished_splits: self.finished.clone(),
            binlog_split: self.binlog_split.clone(),
        }
    }

    async fn maybe_finish_snapshot_phase(&mut self) -> Result<()> {
        let snapshot_phase = matches!(
            self.phase,
            AssignerPhase::SnapshotAssigning | AssignerPhase::SnapshotDraining
        );
        let chunks_done = self.splitters.iter().all(ChunkSplitter::is_exhausted);
        if !snapshot_phase || !chunks_done || !self.pending.is_empty() || !self.in_flight.is_empty()
        {
            return Ok(());
        }
        // All chunks tiled, every split reported: construct the binlog
        // split and move on.
        self.splitters.clear();
        let start = match self.min_high_watermark()? {
            Some(offset) => offset,
            None => self.conn.current_offset().await?,
        };
        self.binlog_split = Some(self.build_binlog_split(start)?);
        self.phase = AssignerPhase::BinlogAssigned;
        info!(
            finished = self.finished.len(),
            start = %self.binlog_split.as_ref().map(|s| s.start_offset.to_string()).unwrap_or_default(),
            "snapshot phase complete, binlog split ready"
        );
        Ok(())
    }

    /// Initial binlog position for binlog-only mode.
    async fn resolve_startup_offset(&self) -> Result<BinlogOffset> {
        match &self.config.startup_mode {
            StartupMode::Initial | StartupMode::LatestOffset => self.conn.current_offset().await,
            StartupMode::EarliestOffset => Ok(BinlogOffset::EARLIEST),
            StartupMode::SpecificOffset(offset) => Ok(offset.clone()),
            StartupMode::Timestamp(epoch_ms) => self.conn.offset_for_timestamp(*epoch_ms).await,
        }
    }

    fn build_binlog_split(&self, start: BinlogOffset) -> Result<BinlogSplit> {
        // The split-level key type mirrors the first captured table; the
        // per-table key columns travel in the schema snapshot.
        let chunk_key_types = self
            .schemas
            .first()
            .map(TableSchema::chunk_key_types)
            .transpose()?
            .unwrap_or_default();
        Ok(BinlogSplit::new(
            chunk_key_types,
            start,
            BinlogOffset::NO_STOPPING,
            self.finished.clone(),
            self.schemas.clone(),
        ))
    }
}
