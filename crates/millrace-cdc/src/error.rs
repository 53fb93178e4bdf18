//! Error types for the CDC source.
//!
//! Errors are split into two behavioral classes: retryable kinds that
//! workers heal locally with backoff, and fatal kinds that are parked in
//! the source failure slot and re-raised at the next poll.

use thiserror::Error;

/// Errors produced by the CDC source.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Transient I/O failure (connection reset, broken stream). Retried
    /// locally with exponential backoff.
    #[error("transient IO error: {0}")]
    TransientIo(String),

    /// An operation exceeded its deadline. Retryable.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer closed the connection. Retryable.
    #[error("connection closed")]
    ConnectionClosed,

    /// The requested binlog offset has been pruned by the server. Fatal:
    /// the job cannot produce a complete stream from this position.
    #[error("binlog position {0} no longer available on the server")]
    BinlogPositionLost(String),

    /// A captured table does not have the columns the source requires.
    #[error("schema mismatch for {table}: {reason}")]
    SchemaMismatch { table: String, reason: String },

    /// Two binlog offsets could not be ordered (different servers, no
    /// GTID overlap).
    #[error("incomparable binlog offsets: {left} vs {right}")]
    IncomparableOffsets { left: String, right: String },

    /// A captured table has neither a declared chunk key nor a primary
    /// key. Raised at discovery time.
    #[error("table {0} has no usable chunk key")]
    ChunkKeyUnavailable(String),

    /// A snapshot split terminated in FAILED after exhausting retries.
    #[error("split {split_id} failed: {source}")]
    SplitExecutionFailed {
        split_id: String,
        #[source]
        source: Box<CdcError>,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was issued in a phase that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Checkpoint state (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    /// Create a transient I/O error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a schema mismatch error.
    pub fn schema_mismatch(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a failure cause into a split-level failure.
    pub fn split_failed(split_id: impl Into<String>, cause: CdcError) -> Self {
        Self::SplitExecutionFailed {
            split_id: split_id.into(),
            source: Box::new(cause),
        }
    }

    /// Whether the error is transient and worth retrying locally.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::TransientIo(_) | Self::Timeout(_) | Self::ConnectionClosed => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::BinlogPositionLost(_)
            | Self::SchemaMismatch { .. }
            | Self::IncomparableOffsets { .. }
            | Self::ChunkKeyUnavailable(_)
            | Self::SplitExecutionFailed { .. }
            | Self::Config(_)
            | Self::InvalidState(_)
            | Self::Serialization(_) => false,
        }
    }
}

/// Result type for CDC operations.
pub type Result<T> = std::result::Result<T, CdcError>;
