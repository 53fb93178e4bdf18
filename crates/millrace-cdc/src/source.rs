//! Source orchestration: assigner owner task, reader workers, and the
//! poll/cancel handle.
//!
//! The assigner runs in its own task and owns its state exclusively;
//! workers talk to it through explicit messages with reply channels.
//! Each worker owns a logical connection and a replication server id from
//! the configured range, executes snapshot splits to completion, and
//! eventually one worker takes over the binlog split. Emitted events flow
//! through a bounded channel drained by [`SourceHandle::poll`].
//!
//! Failure policy: retryable errors heal inside the readers; the first
//! fatal error lands in a single-slot failure cell, flips the running
//! flag so every worker stops at its next suspension point, and is
//! re-raised by the next `poll`.

use crate::assigner::SplitAssigner;
use crate::binlog_reader::BinlogSplitReader;
use crate::config::SourceConfig;
use crate::connection::{Checkpointer, EventSink, SqlConnection};
use crate::error::{CdcError, Result};
use crate::event::ChangeEvent;
use crate::offset::BinlogOffset;
use crate::schema::TableSchemaProvider;
use crate::snapshot_reader::SnapshotSplitReader;
use crate::split::{FinishedSnapshotSplitInfo, Split};
use crate::state::{AssignerPhase, AssignerState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Idle delay between split requests when nothing is ready.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reply to a worker's split request.
#[derive(Debug)]
enum SplitOffer {
    Assigned(Split),
    /// Nothing ready right now; ask again.
    Pending,
    /// The job is terminal; the worker can exit.
    Finished,
}

/// Messages from workers (and the handle) to the assigner owner task.
enum AssignerCommand {
    NextSplit {
        worker_id: u32,
        reply: oneshot::Sender<Result<SplitOffer>>,
    },
    SplitFinished {
        info: FinishedSnapshotSplitInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    SplitFailed {
        worker_id: u32,
        split_id: String,
        reply: oneshot::Sender<bool>,
    },
    WorkerFailed {
        worker_id: u32,
    },
    BinlogProgress {
        offset: BinlogOffset,
    },
    BinlogFinished,
    Checkpoint {
        reply: oneshot::Sender<AssignerState>,
    },
}

/// First-fatal-error cell shared by the workers and the handle.
#[derive(Clone, Default)]
struct FailureSlot(Arc<Mutex<Option<CdcError>>>);

impl FailureSlot {
    fn set(&self, err: CdcError) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<CdcError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Sink forwarding events into the handle's channel.
#[derive(Clone)]
struct ChannelSink {
    tx: mpsc::Sender<ChangeEvent>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CdcError::ConnectionClosed)
    }
}

/// The incremental-snapshot CDC source. Construct, then [`start`] to get
/// a [`SourceHandle`] for polling.
///
/// [`start`]: MySqlSource::start
pub struct MySqlSource<C: SqlConnection + Clone + Send + Sync + 'static> {
    config: SourceConfig,
    conn: C,
    provider: Arc<dyn TableSchemaProvider>,
    restore_state: Option<AssignerState>,
}

impl<C: SqlConnection + Clone + Send + Sync + 'static> MySqlSource<C> {
    pub fn new(config: SourceConfig, conn: C, provider: Arc<dyn TableSchemaProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            conn,
            provider,
            restore_state: None,
        })
    }

    /// Construct from checkpoint bytes produced by
    /// [`SourceHandle::checkpoint`].
    pub fn restore(
        config: SourceConfig,
        conn: C,
        provider: Arc<dyn TableSchemaProvider>,
        checkpoint: &[u8],
    ) -> Result<Self> {
        config.validate()?;
        let state = AssignerState::from_bytes(checkpoint)?;
        Ok(Self {
            config,
            conn,
            provider,
            restore_state: Some(state),
        })
    }

    /// Discover tables, spawn the assigner owner task and the workers,
    /// and return the handle owning the background work.
    pub async fn start(self) -> Result<SourceHandle> {
        let mut assigner = match self.restore_state {
            Some(state) => SplitAssigner::restore(
                self.conn.clone(),
                self.provider.clone(),
                self.config.clone(),
                state,
            )?,
            None => SplitAssigner::new(
                self.conn.clone(),
                self.provider.clone(),
                self.config.clone(),
            ),
        };
        // Discovery failures (no tables, missing chunk keys) surface here
        // rather than inside a background task.
        assigner.open().await?;

        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer_size);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let failure = FailureSlot::default();

        let assigner_task = tokio::spawn(run_assigner(assigner, cmd_rx));

        let mut workers = Vec::with_capacity(self.config.parallelism as usize);
        for worker_id in 0..self.config.parallelism {
            let ctx = WorkerContext {
                worker_id,
                server_id: self.config.server_id_range.server_id_for(worker_id),
                conn: self.conn.clone(),
                config: self.config.clone(),
                commands: cmd_tx.clone(),
                sink: ChannelSink {
                    tx: event_tx.clone(),
                },
                running: running.clone(),
                failure: failure.clone(),
            };
            workers.push(tokio::spawn(run_worker(ctx)));
        }
        info!(parallelism = self.config.parallelism, "source started");

        Ok(SourceHandle {
            events: event_rx,
            commands: cmd_tx,
            running,
            failure,
            workers,
            assigner_task,
        })
    }
}

/// Handle to a started source: poll for events, checkpoint, cancel.
/// Dropping the handle without `cancel` leaves the background tasks to
/// wind down on their own once their channels close.
pub struct SourceHandle {
    events: mpsc::Receiver<ChangeEvent>,
    commands: mpsc::UnboundedSender<AssignerCommand>,
    running: Arc<AtomicBool>,
    failure: FailureSlot,
    workers: Vec<JoinHandle<()>>,
    assigner_task: JoinHandle<()>,
}

impl SourceHandle {
    /// Drain the failure slot, then collect whatever events are ready.
    ///
    /// `Ok(Some(vec![]))` means nothing is ready right now; `Ok(None)`
    /// means every worker has exited and the stream is complete.
    pub async fn poll(&mut self) -> Result<Option<Vec<ChangeEvent>>> {
        if let Some(err) = self.failure.take() {
            self.running.store(false, Ordering::Relaxed);
            return Err(err);
        }
        let mut batch = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => batch.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if batch.is_empty() {
                        // Workers are gone; surface a late failure if one
                        // raced the channel closing.
                        if let Some(err) = self.failure.take() {
                            return Err(err);
                        }
                        return Ok(None);
                    }
                    break;
                }
            }
        }
        Ok(Some(batch))
    }

    /// Serialize the assigner state for an external checkpoint store.
    pub async fn checkpoint(&self) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(AssignerCommand::Checkpoint { reply })
            .map_err(|_| CdcError::invalid_state("assigner task stopped"))?;
        let state = rx
            .await
            .map_err(|_| CdcError::invalid_state("assigner task stopped"))?;
        state.to_bytes()
    }

    /// Checkpoint into an external [`Checkpointer`]; returns the id.
    pub async fn checkpoint_into(&self, checkpointer: &dyn Checkpointer) -> Result<u64> {
        let bytes = self.checkpoint().await?;
        let id = checkpointer.next_checkpoint_id();
        checkpointer.store(id, bytes).await?;
        debug!(checkpoint_id = id, "checkpoint stored");
        Ok(id)
    }

    /// Cooperatively stop every worker and wait for them to exit.
    pub async fn cancel(mut self) -> Result<()> {
        info!("cancelling source");
        self.running.store(false, Ordering::Relaxed);
        // Unblock workers parked on a full event channel.
        self.events.close();
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker task panicked during shutdown");
            }
        }
        drop(self.commands);
        if let Err(err) = self.assigner_task.await {
            warn!(error = %err, "assigner task panicked during shutdown");
        }
        Ok(())
    }
}

/// Owner loop: applies commands to the assigner serially.
async fn run_assigner<C: SqlConnection + Clone>(
    mut assigner: SplitAssigner<C>,
    mut commands: mpsc::UnboundedReceiver<AssignerCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            AssignerCommand::NextSplit { worker_id, reply } => {
                let offer = assigner.next_split(worker_id).await.map(|split| match split {
                    Some(split) => SplitOffer::Assigned(split),
                    None if assigner.phase() == AssignerPhase::Terminal => SplitOffer::Finished,
                    None => SplitOffer::Pending,
                });
                let _ = reply.send(offer);
            }
            AssignerCommand::SplitFinished { info, reply } => {
                let _ = reply.send(assigner.on_split_finished(info).await);
            }
            AssignerCommand::SplitFailed {
                worker_id,
                split_id,
                reply,
            } => {
                let _ = reply.send(assigner.on_split_failed(worker_id, &split_id));
            }
            AssignerCommand::WorkerFailed { worker_id } => {
                assigner.on_worker_failure(worker_id);
            }
            AssignerCommand::BinlogProgress { offset } => {
                assigner.on_binlog_progress(offset);
            }
            AssignerCommand::BinlogFinished => {
                assigner.close();
            }
            AssignerCommand::Checkpoint { reply } => {
                let _ = reply.send(assigner.snapshot_state());
            }
        }
    }
    debug!("assigner owner task stopped");
}

struct WorkerContext<C: SqlConnection + Clone> {
    worker_id: u32,
    server_id: u32,
    conn: C,
    config: SourceConfig,
    commands: mpsc::UnboundedSender<AssignerCommand>,
    sink: ChannelSink,
    running: Arc<AtomicBool>,
    failure: FailureSlot,
}

impl<C: SqlConnection + Clone> WorkerContext<C> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Record a fatal error and stop every worker.
    fn fail(&self, err: CdcError) {
        error!(worker = self.worker_id, error = %err, "worker hit fatal error");
        self.failure.set(err);
        self.running.store(false, Ordering::Relaxed);
    }

    async fn request_split(&self) -> Option<Result<SplitOffer>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(AssignerCommand::NextSplit {
                worker_id: self.worker_id,
                reply,
            })
            .ok()?;
        rx.await.ok()
    }
}

async fn wait_cancelled(running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        sleep(IDLE_POLL_INTERVAL).await;
    }
}

/// Worker loop: request a split, execute it, report back, repeat.
async fn run_worker<C: SqlConnection + Clone + Send + Sync + 'static>(ctx: WorkerContext<C>) {
    debug!(worker = ctx.worker_id, server_id = ctx.server_id, "worker started");
    while ctx.is_running() {
        let offer = match ctx.request_split().await {
            Some(Ok(offer)) => offer,
            Some(Err(err)) => {
                ctx.fail(err);
                break;
            }
            // Assigner task gone; the job is shutting down.
            None => break,
        };
        match offer {
            SplitOffer::Finished => break,
            SplitOffer::Pending => sleep(IDLE_POLL_INTERVAL).await,
            SplitOffer::Assigned(Split::Snapshot(split)) => {
                let mut reader =
                    SnapshotSplitReader::new(ctx.conn.clone(), ctx.config.retry.clone());
                tokio::select! {
                    _ = wait_cancelled(&ctx.running) => {
                        // Mid-split cancellation: the partial work is
                        // discarded and the split goes back to pending.
                        let _ = ctx.commands.send(AssignerCommand::WorkerFailed {
                            worker_id: ctx.worker_id,
                        });
                        break;
                    }
                    result = reader.execute(&split) => match result {
                        Ok((info, batch)) => {
                            let mut emitted_ok = true;
                            for event in batch {
                                if ctx.sink.emit(event).await.is_err() {
                                    emitted_ok = false;
                                    break;
                                }
                            }
                            if !emitted_ok {
                                // Receiver dropped: shutdown in progress.
                                let _ = ctx.commands.send(AssignerCommand::WorkerFailed {
                                    worker_id: ctx.worker_id,
                                });
                                break;
                            }
                            let (reply, rx) = oneshot::channel();
                            let sent = ctx
                                .commands
                                .send(AssignerCommand::SplitFinished { info, reply })
                                .is_ok();
                            match rx.await {
                                Ok(Err(err)) => {
                                    ctx.fail(err);
                                    break;
                                }
                                Err(_) if sent => break,
                                _ => {}
                            }
                        }
                        Err(err) => {
                            let (reply, rx) = oneshot::channel();
                            let _ = ctx.commands.send(AssignerCommand::SplitFailed {
                                worker_id: ctx.worker_id,
                                split_id: split.split_id.clone(),
                                reply,
                            });
                            let will_retry = rx.await.unwrap_or(false);
                            if !will_retry {
                                ctx.fail(err);
                                break;
                            }
                            warn!(
                                worker = ctx.worker_id,
                                split_id = %split.split_id,
                                "split execution failed, assigner will rerun it"
                            );
                        }
                    }
                }
            }
            SplitOffer::Assigned(Split::Binlog(split)) => {
                let reader = BinlogSplitReader::new(
                    ctx.conn.clone(),
                    split,
                    ctx.config.retry.clone(),
                );
                let mut reader = match reader {
                    Ok(reader) => reader,
                    Err(err) => {
                        ctx.fail(err);
                        break;
                    }
                };
                let sink = ProgressSink {
                    inner: ctx.sink.clone(),
                    commands: ctx.commands.clone(),
                };
                match reader.run(&sink, &ctx.running).await {
                    Ok(last) => {
                        debug!(worker = ctx.worker_id, last = %last, "binlog split finished");
                        let _ = ctx.commands.send(AssignerCommand::BinlogProgress {
                            offset: last,
                        });
                        let _ = ctx.commands.send(AssignerCommand::BinlogFinished);
                    }
                    Err(err) => {
                        ctx.fail(err);
                        break;
                    }
                }
            }
        }
    }
    debug!(worker = ctx.worker_id, "worker stopped");
}

/// Sink wrapper reporting consumed offsets so checkpoints resume where
/// the binlog reader left off.
struct ProgressSink {
    inner: ChannelSink,
    commands: mpsc::UnboundedSender<AssignerCommand>,
}

#[async_trait]
impl EventSink for ProgressSink {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        let offset = event.offset.clone();
        self.inner.emit(event).await?;
        let _ = self
            .commands
            .send(AssignerCommand::BinlogProgress { offset });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerIdRange, StartupMode};
    use crate::event::OpType;
    use crate::memory::{MemoryCheckpointer, MemoryDatabase};
    use crate::schema::{ColumnSchema, ColumnType, TableId, TableSchema};
    use serde_json::json;

    fn products() -> TableId {
        TableId::new("shop", "products")
    }

    fn setup(ids: impl IntoIterator<Item = i64>) -> MemoryDatabase {
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
        db
    }

    async fn drain(handle: &mut SourceHandle) -> Vec<ChangeEvent> {
        let mut all = Vec::new();
        loop {
            match handle.poll().await.unwrap() {
                Some(batch) if batch.is_empty() => sleep(Duration::from_millis(2)).await,
                Some(batch) => all.extend(batch),
                None => return all,
            }
        }
    }

    fn config(parallelism: u32) -> SourceConfig {
        SourceConfig::builder()
            .chunk_size(4)
            .parallelism(parallelism)
            .server_id_range(ServerIdRange::new(5400, 5407))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_then_binlog_drains_to_completion() {
        let db = setup(1..=9);
        let source =
            MySqlSource::new(config(2), db.clone(), Arc::new(db.clone())).unwrap();
        let mut handle = source.start().await.unwrap();
        let events = drain(&mut handle).await;

        // Nine snapshot inserts, no binlog activity.
        assert_eq!(events.len(), 9);
        assert!(events.iter().all(|e| e.op == OpType::Insert && e.source_meta.snapshot));
        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_failure_surfaces_at_start() {
        let db = MemoryDatabase::new();
        db.create_table(TableSchema::new(
            TableId::new("shop", "audit_log"),
            vec![ColumnSchema::new("note", ColumnType::Text)],
            vec![],
        ));
        let source =
            MySqlSource::new(config(1), db.clone(), Arc::new(db.clone())).unwrap();
        let err = source.start().await.map(|_| ()).unwrap_err();
        assert!(matches!(err, CdcError::ChunkKeyUnavailable(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_round_trips_through_store() {
        let db = setup(1..=9);
        let source =
            MySqlSource::new(config(1), db.clone(), Arc::new(db.clone())).unwrap();
        let handle = source.start().await.unwrap();

        let store = MemoryCheckpointer::new();
        let id = handle.checkpoint_into(&store).await.unwrap();
        assert_eq!(id, 1);
        let bytes = store.load_latest().await.unwrap().unwrap();
        assert!(AssignerState::from_bytes(&bytes).is_ok());
        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_binlog_only_source_streams_changes() {
        let db = setup([]);
        db.insert(&products(), json!({"id": 1, "name": "pre"}));
        let start = db.head_offset();
        // Activity after the start position.
        db.insert(&products(), json!({"id": 2, "name": "post"}));
        db.update(&products(), json!({"id": 2, "name": "edited"}));

        let config = SourceConfig::builder()
            .startup_mode(StartupMode::SpecificOffset(start))
            .build()
            .unwrap();
        let source =
            MySqlSource::new(config, db.clone(), Arc::new(db.clone())).unwrap();
        let mut handle = source.start().await.unwrap();
        let events = drain(&mut handle).await;
        // The pre-start insert is not replayed; the post-start insert and
        // the update retract pair are.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].op, OpType::Insert);
        assert_eq!(events[0].after.as_ref().unwrap()["id"], 2);
        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_reraised_at_poll() {
        let db = setup([]);
        let start = db.head_offset();
        db.insert(&products(), json!({"id": 1}));
        let head = db.insert(&products(), json!({"id": 2}));
        db.purge_binlog_before(head);

        let config = SourceConfig::builder()
            .startup_mode(StartupMode::SpecificOffset(start))
            .build()
            .unwrap();
        let source =
            MySqlSource::new(config, db.clone(), Arc::new(db.clone())).unwrap();
        let mut handle = source.start().await.unwrap();

        let err = loop {
            match handle.poll().await {
                Ok(Some(_)) => sleep(Duration::from_millis(2)).await,
                Ok(None) => panic!("stream ended without surfacing the failure"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, CdcError::BinlogPositionLost(_)));
        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_workers() {
        let db = setup(1..=9);
        let source =
            MySqlSource::new(config(2), db.clone(), Arc::new(db.clone())).unwrap();
        let handle = source.start().await.unwrap();
        // Cancel promptly; workers must wind down without panicking.
        handle.cancel().await.unwrap();
    }
}
