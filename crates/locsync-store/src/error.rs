//! Error types for locsync-store.

use std::path::PathBuf;

/// Result type for locsync-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in locsync-store.
#[derive(Debug, thiserror::Error)]
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

    /// A stored value could not be decoded.
    #[error("Corrupt value for {key}: {value}")]
    CorruptValue { key: String, value: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
