//! Error types for vitalband-store.

use std::path::PathBuf;

/// Result type for vitalband-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vitalband-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A sample of one metric was handed to another metric's table.
    #[error("{found} sample cannot be stored as {expected}")]
    MetricMismatch { expected: String, found: String },

    /// Invalid day string.
    #[error(transparent)]
    InvalidDay(#[from] vitalband_types::ParseError),

    /// The blocking worker running a query went away.
    #[error("Storage worker failed: {0}")]
    Worker(String),
}

impl From<Error> for vitalband_core::Error {
    fn from(e: Error) -> Self {
        vitalband_core::Error::storage(e.to_string())
    }
}
