//! Table identity and schema metadata.
//!
//! Schemas are captured once at discovery time and carried inside the
//! splits, so readers never re-resolve them mid-job (schema evolution
//! during a snapshot is out of scope).

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified table identifier (`database.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub database: String,
    pub table: String,
}

impl TableId {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// MySQL column type classes relevant to chunking and key comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// TINYINT .. BIGINT
    Integer,
    /// BIGINT UNSIGNED and friends
    UnsignedInteger,
    /// FLOAT / DOUBLE
    Float,
    /// DECIMAL
    Decimal,
    /// CHAR / VARCHAR / TEXT
    Text,
    /// BINARY / VARBINARY / BLOB
    Binary,
    /// DATE / TIME / DATETIME / TIMESTAMP, compared in their text form
    Temporal,
}

impl ColumnType {
    /// Whether evenly-spaced numeric chunk ranges can be computed for a
    /// key of this type.
    pub fn is_evenly_splittable(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::UnsignedInteger)
    }
}

/// A single column of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Schema snapshot of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_id: TableId,
    pub columns: Vec<ColumnSchema>,
    /// Primary key column names, in key order.
    pub primary_key: Vec<String>,
    /// Declared chunk key column names; empty means "use the primary key".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunk_key: Vec<String>,
}

impl TableSchema {
    pub fn new(table_id: TableId, columns: Vec<ColumnSchema>, primary_key: Vec<String>) -> Self {
        Self {
            table_id,
            columns,
            primary_key,
            chunk_key: Vec::new(),
        }
    }

    /// Declare an explicit chunk key (overrides the primary key).
    pub fn with_chunk_key(mut self, columns: Vec<String>) -> Self {
        self.chunk_key = columns;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The columns a chunk splitter partitions this table by.
    ///
    /// Falls back to the primary key; a table with neither is refused with
    /// [`CdcError::ChunkKeyUnavailable`].
    pub fn chunk_key_columns(&self) -> Result<&[String]> {
        if !self.chunk_key.is_empty() {
            return Ok(&self.chunk_key);
        }
        if !self.primary_key.is_empty() {
            return Ok(&self.primary_key);
        }
        Err(CdcError::ChunkKeyUnavailable(self.table_id.to_string()))
    }

    /// Column types of the chunk key, for carrying inside the binlog split.
    pub fn chunk_key_types(&self) -> Result<Vec<ColumnType>> {
        self.chunk_key_columns()?
            .iter()
            .map(|name| {
                self.column(name)
                    .map(|c| c.column_type)
                    .ok_or_else(|| {
                        CdcError::schema_mismatch(
                            self.table_id.to_string(),
                            format!("chunk key column {name} not found"),
                        )
                    })
            })
            .collect()
    }

    /// Fail fast when the declared key columns do not exist.
    pub fn validate(&self) -> Result<()> {
        for name in self.primary_key.iter().chain(self.chunk_key.iter()) {
            if self.column(name).is_none() {
                return Err(CdcError::schema_mismatch(
                    self.table_id.to_string(),
                    format!("key column {name} not found"),
                ));
            }
        }
        Ok(())
    }
}

/// Resolves table lists and schemas from the source database.
///
/// Implemented by the driver adapter; the in-memory double in
/// [`crate::memory`] implements it for tests.
#[async_trait]
pub trait TableSchemaProvider: Send + Sync {
    /// Enumerate every base table visible to the connection.
    async fn list_tables(&self) -> Result<Vec<TableId>>;

    /// Describe one table, including primary and chunk key columns.
    async fn describe(&self, table_id: &TableId) -> Result<TableSchema>;
}
