//! # TileKeep Image
//!
//! Raster payload handling for the TileKeep cache engine: lazy byte/image
//! carriers ([`ImageSource`]), layer and band merging, meta-tile splitting,
//! same-SRS rescaling and coverage masking.

pub mod error;
pub mod mask;
pub mod merge;
pub mod opts;
pub mod source;
pub mod tile;
pub mod transform;

pub use error::{Error, Result};
pub use merge::{merge_images, BandMerger, BandOp, LayerMerger, MergeLayer};
pub use opts::{create_image, ColorMode, ImageOptions, Resampling, TileFormat};
pub use source::{single_color, ImageSource, SolidColor};
pub use tile::{TileMerger, TileSplitter, TiledImage};
pub use transform::ImageTransformer;
