use arrow::error::ArrowError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("No scalar index on column: {0}")]
    IndexNotFound(String),

    #[error("Row {row} out of range (table has {num_rows} rows)")]
    RowOutOfRange { row: u64, num_rows: u64 },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Timed out waiting for lock on table {0}")]
    LockTimeout(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Manifest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
