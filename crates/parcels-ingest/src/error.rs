//! Error types for the ingestion pipeline
//!
//! Only failures that unwind a scope are represented as errors. Malformed
//! rows and batches that exhaust their retries are counted outcomes handled
//! in place; they never abort the file or the run.

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error type for ingestion operations
#[derive(Error, Debug)]
pub enum IngestError {
    /// Missing/invalid startup parameters or unreachable staging service.
    /// Fatal: aborts the run before any file is processed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system operation failed
    #[error("File operation failed: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    /// CSV stream could not be read (encoding or framing error)
    #[error("CSV read error: {0}")]
    Csv(#[from] csv_async::Error),

    /// A source file has no header row to derive column names from
    #[error("File has no header row: {0}")]
    MissingHeader(String),

    /// Staging service call failed
    #[error("Staging service error: {0}")]
    Store(#[from] StoreError),

    /// A spawned worker or aggregator task panicked or was aborted
    #[error("Internal task failure: {0}")]
    Task(String),
}

impl IngestError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
