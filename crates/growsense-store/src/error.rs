//! Error types for growsense-store.

use std::path::PathBuf;

/// Result type for growsense-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in growsense-store.
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

    /// Device not found for this user.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device id is already registered to a different user.
    #[error("Device {0} is already registered to another user")]
    DeviceOwnedByOtherUser(String),

    /// Stored timestamp out of range.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV export error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
