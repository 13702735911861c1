//! Upstream source contract

use async_trait::async_trait;
use thiserror::Error;
use tilekeep_grid::{BBox, Coverage, Srs, TileCoord};
use tilekeep_image::{ImageSource, TileFormat};

/// One map request against an upstream source
#[derive(Debug, Clone)]
pub struct MapQuery {
    /// Requested extent
    pub bbox: BBox,
    /// Requested image size in pixels
    pub size: (u32, u32),
    /// Spatial reference of the bbox
    pub srs: Srs,
    /// Requested image format
    pub format: TileFormat,
}

/// Errors raised by upstream sources.
///
/// `Blank` is a signal, not a failure: the source has nothing to
/// contribute for the queried extent and the caller drops it.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source would only return an empty image
    #[error("blank image")]
    Blank,

    /// The source failed; aborts the affected tile but not the batch
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn other(err: impl std::fmt::Display) -> Self {
        SourceError::Other(err.to_string())
    }
}

/// A producer of map imagery queried on cache miss
#[async_trait]
pub trait MapSource: Send + Sync {
    /// Render or fetch the image for `query`
    async fn get_map(&self, query: &MapQuery) -> Result<ImageSource, SourceError>;

    /// False for sources that can only render single tiles
    fn supports_meta_tiles(&self) -> bool {
        true
    }

    /// True if images from this source carry transparency
    fn transparent(&self) -> bool {
        false
    }

    /// Opacity applied when this source is merged over others
    fn opacity(&self) -> Option<f32> {
        None
    }

    /// Area this source can produce imagery for
    fn coverage(&self) -> Option<&Coverage> {
        None
    }

    /// Direct tile access when the source is itself a tile cache;
    /// required for bulk meta-tile mode
    fn tile_access(&self) -> Option<&dyn TileAccess> {
        None
    }
}

/// Per-tile access into an upstream tile cache
#[async_trait]
pub trait TileAccess: Send + Sync {
    /// The stored tile at `coord`, or `None` if the upstream cache does
    /// not have it
    async fn get_tile(&self, coord: TileCoord) -> Result<Option<ImageSource>, SourceError>;
}
