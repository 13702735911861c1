//! Error types for the tile pipeline

use thiserror::Error;

/// Errors surfaced by the tile manager and creator
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid manager configuration; raised at construction only
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage backend error (including lock timeouts)
    #[error(transparent)]
    Cache(#[from] tilekeep_cache::CacheError),

    /// Raster payload error
    #[error(transparent)]
    Image(#[from] tilekeep_image::Error),

    /// Grid or coverage error
    #[error(transparent)]
    Grid(#[from] tilekeep_grid::GridError),

    /// An upstream source failed
    #[error("Source error: {0}")]
    Source(String),
}

impl EngineError {
    /// True for conditions worth retrying, e.g. a lock timeout while
    /// another process creates the same tile
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Cache(err) if err.is_retriable())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EngineError>;
