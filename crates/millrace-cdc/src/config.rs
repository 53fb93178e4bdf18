//! Source configuration.
//!
//! Built through a validating builder: invalid combinations (empty server
//! id range, unparsable filter regex, zero chunk size) are rejected at
//! `build()` time rather than surfacing mid-job.

use crate::error::{CdcError, Result};
use crate::offset::BinlogOffset;
use crate::resilience::RetryPolicy;
use crate::schema::TableId;
use regex::Regex;

/// Where the source starts and whether a snapshot runs first.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StartupMode {
    /// Snapshot the captured tables, then continue from the binlog
    /// positions bracketing the snapshot.
    #[default]
    Initial,
    /// No snapshot; stream from the server's current position.
    LatestOffset,
    /// No snapshot; stream from the beginning of the retained binlog.
    EarliestOffset,
    /// No snapshot; stream from an explicit position.
    SpecificOffset(BinlogOffset),
    /// No snapshot; stream from the first position at or after the given
    /// epoch-millisecond timestamp.
    Timestamp(i64),
}

/// Inclusive range of MySQL replication server ids, one per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerIdRange {
    pub start: u32,
    pub end: u32,
}

impl ServerIdRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// The server id assigned to a worker index.
    pub fn server_id_for(&self, worker_id: u32) -> u32 {
        self.start + worker_id
    }
}

impl Default for ServerIdRange {
    fn default() -> Self {
        // Arbitrary default block; deployments should pick their own.
        Self::new(5400, 5404)
    }
}

/// Compiled database/table inclusion filters.
///
/// The database pattern matches the database name; the table pattern
/// matches the qualified `database.table` name. Both are anchored.
#[derive(Debug, Clone)]
pub struct TableFilters {
    database: Option<Regex>,
    table: Option<Regex>,
}

impl TableFilters {
    pub fn compile(database: Option<&str>, table: Option<&str>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|e| CdcError::config(format!("invalid filter regex {pattern:?}: {e}")))
        };
        Ok(Self {
            database: database.map(compile).transpose()?,
            table: table.map(compile).transpose()?,
        })
    }

    pub fn matches(&self, table_id: &TableId) -> bool {
        if let Some(db) = &self.database {
            if !db.is_match(&table_id.database) {
                return false;
            }
        }
        if let Some(table) = &self.table {
            if !table.is_match(&table_id.to_string()) {
                return false;
            }
        }
        true
    }
}

/// Configuration of the CDC source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub startup_mode: StartupMode,
    /// Target rows per snapshot split.
    pub chunk_size: u64,
    /// Number of reader workers.
    pub parallelism: u32,
    pub server_id_range: ServerIdRange,
    /// Regex over database names; `None` captures every database.
    pub database_filter: Option<String>,
    /// Regex over qualified `database.table` names.
    pub table_filter: Option<String>,
    /// When false the source behaves as a binlog-only source regardless
    /// of startup mode.
    pub incremental_snapshot: bool,
    pub retry: RetryPolicy,
    /// Times a failed snapshot split is rerun from scratch before the job
    /// escalates the failure.
    pub max_split_retries: u32,
    /// Capacity of the emitted-event channel between workers and `poll`.
    pub event_buffer_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            startup_mode: StartupMode::Initial,
            chunk_size: 8096,
            parallelism: 1,
            server_id_range: ServerIdRange::default(),
            database_filter: None,
            table_filter: None,
            incremental_snapshot: true,
            retry: RetryPolicy::default(),
            max_split_retries: 3,
            event_buffer_size: 8192,
        }
    }
}

impl SourceConfig {
    pub fn builder() -> SourceConfigBuilder {
        SourceConfigBuilder::default()
    }

    /// Whether the job starts with a snapshot phase.
    pub fn snapshot_enabled(&self) -> bool {
        self.incremental_snapshot && self.startup_mode == StartupMode::Initial
    }

    pub fn filters(&self) -> Result<TableFilters> {
        TableFilters::compile(self.database_filter.as_deref(), self.table_filter.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CdcError::config("chunk_size must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(CdcError::config("parallelism must be at least 1"));
        }
        if self.server_id_range.is_empty() || self.server_id_range.len() < self.parallelism {
            return Err(CdcError::config(format!(
                "server id range {}..={} provides {} ids but parallelism is {}",
                self.server_id_range.start,
                self.server_id_range.end,
                self.server_id_range.len(),
                self.parallelism
            )));
        }
        if self.event_buffer_size == 0 {
            return Err(CdcError::config("event_buffer_size must be at least 1"));
        }
        self.filters().map(|_| ())
    }
}

/// Builder for [`SourceConfig`].
#[derive(Debug, Default)]
pub struct SourceConfigBuilder {
    config: SourceConfig,
}

impl SourceConfigBuilder {
    pub fn startup_mode(mut self, mode: StartupMode) -> Self {
        self.config.startup_mode = mode;
        self
    }

    pub fn chunk_size(mut self, size: u64) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn parallelism(mut self, workers: u32) -> Self {
        self.config.parallelism = workers;
        self
    }

    pub fn server_id_range(mut self, range: ServerIdRange) -> Self {
        self.config.server_id_range = range;
        self
    }

    pub fn database_filter(mut self, pattern: impl Into<String>) -> Self {
        self.config.database_filter = Some(pattern.into());
        self
    }

    pub fn table_filter(mut self, pattern: impl Into<String>) -> Self {
        self.config.table_filter = Some(pattern.into());
        self
    }

    pub fn incremental_snapshot(mut self, enabled: bool) -> Self {
        self.config.incremental_snapshot = enabled;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_split_retries(mut self, retries: u32) -> Self {
        self.config.max_split_retries = retries;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> Result<SourceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
