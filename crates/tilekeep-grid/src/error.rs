//! Error types for grid construction and queries

use thiserror::Error;

use crate::coord::Srs;

/// Errors raised by grid construction and coverage queries
#[derive(Error, Debug)]
pub enum GridError {
    /// Invalid grid configuration
    #[error("Invalid grid configuration: {0}")]
    InvalidGrid(String),

    /// Coordinate outside of the grid
    #[error("Tile coordinate {x},{y},{z} outside of grid")]
    OutOfBounds { x: u32, y: u32, z: u8 },

    /// Zoom level outside of the grid
    #[error("Zoom level {zoom} outside of grid (levels: {levels})")]
    InvalidZoom { zoom: u8, levels: u8 },

    /// Geometry in a different SRS than the grid
    #[error("SRS mismatch: expected {expected}, got {actual}")]
    SrsMismatch { expected: Srs, actual: Srs },
}

/// Result type alias for grid operations
pub type Result<T> = std::result::Result<T, GridError>;
