use thiserror::Error;

pub use collector::{CatalogError, RetrievalError};

/// No usable header; fatal to the source, not to the run
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedTableError {
    #[error("table has no header row")]
    MissingHeader,

    #[error("duplicate column name '{column}' at positions {first} and {second}")]
    DuplicateColumn {
        column: String,
        first: usize,
        second: usize,
    },

    #[error("identity column '{0}' not present in header")]
    MissingIdentityColumn(String),

    #[error("unknown encoding label '{0}'")]
    UnknownEncoding(String),

    #[error("header could not be read: {0}")]
    Header(String),
}

/// A single row or cell that could not be used; row-local
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseValueError {
    #[error("line {line}: unreadable record: {message}")]
    Record { line: usize, message: String },

    #[error("line {line}: identity value is empty")]
    MissingIdentity { line: usize },
}

/// Rejection reported by the target store for one upsert call
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid identifier: {0}")]
    Identifier(#[from] CatalogError),

    #[error("batch rows do not share a column set")]
    Heterogeneous,

    #[error("row is missing conflict key '{0}'")]
    MissingConflictKey(String),

    #[error("conflict key {0} appears more than once in the batch")]
    DuplicateConflictKey(String),

    #[error("store rejected batch: {0}")]
    Rejected(String),
}

/// One failed batch; counted and logged, never propagated
#[derive(Debug, Error)]
#[error("table {table} batch {batch} ({rows} rows) failed: {source}")]
pub struct LoadError {
    pub table: String,
    pub batch: usize,
    pub rows: usize,
    #[source]
    pub source: StoreError,
}

/// Failures that end the run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no sources could be retrieved ({attempted} attempted)")]
    NoSourcesRetrieved { attempted: usize },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("report I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Config(String),
}
