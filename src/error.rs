//! Error types for the storage engine.

use thiserror::Error;

/// Errors raised by the engine and its persistence layer.
///
/// `BadRequest` and `DimensionMismatch` surface to HTTP callers as 400s;
/// the remaining kinds stay inside the engine (logged, or returned from
/// `Database::open`).
#[derive(Debug, Error)]
pub enum DbError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("index file corrupt: {0}")]
    IndexCorrupt(String),

    #[error("snapshot write failed for table '{table}': {source}")]
    Snapshot {
        table: String,
        #[source]
        source: std::io::Error,
    },

    #[error("database is shut down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
