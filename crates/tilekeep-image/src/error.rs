//! Error types for raster handling

use thiserror::Error;

/// Errors raised while decoding, encoding or combining raster data
#[derive(Error, Debug)]
pub enum Error {
    /// Encoding or decoding failed
    #[error("Image codec error: {0}")]
    Codec(#[from] image::ImageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown or unsupported image format
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// Invalid band merge configuration
    #[error("Invalid band mapping: {0}")]
    BandMapping(String),

    /// Grid error while masking or transforming
    #[error(transparent)]
    Grid(#[from] tilekeep_grid::GridError),
}

/// Result type alias for raster operations
pub type Result<T> = std::result::Result<T, Error>;
