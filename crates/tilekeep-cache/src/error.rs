//! Error types for the cache backends

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cache operations.
///
/// Ordinary absence is never an error: loads return `Ok(false)` for missing
/// tiles. Errors signal corruption, unreachable backends, lock timeouts or
/// invalid configuration.
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raster payload error
    #[error(transparent)]
    Image(#[from] tilekeep_image::Error),

    /// Grid or coverage error
    #[error(transparent)]
    Grid(#[from] tilekeep_grid::GridError),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Could not acquire a lock before the timeout
    #[error("Lock timeout: another process is still holding {path}")]
    LockTimeout { path: PathBuf },

    /// On-disk data does not match the expected format
    #[error("Corrupt cache data in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Invalid backend configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Background task failed to run to completion
    #[error("Backend task failed: {0}")]
    Task(String),
}

impl CacheError {
    /// True if retrying the operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, CacheError::LockTimeout { .. })
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Task(err.to_string())
    }
}
