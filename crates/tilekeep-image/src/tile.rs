//! Merging tiles into larger images and splitting meta tiles

use std::sync::Arc;

use image::{imageops, DynamicImage};
use tilekeep_grid::BBox;
use tracing::warn;

use crate::error::Result;
use crate::opts::{create_image, ImageOptions, TileFormat};
use crate::source::ImageSource;
use crate::transform::ImageTransformer;

/// Merges a grid of tiles into one image
#[derive(Debug)]
pub struct TileMerger {
    /// Tile columns and rows
    pub tile_grid: (u32, u32),
    /// Size of each tile in pixels
    pub tile_size: (u32, u32),
}

impl TileMerger {
    pub fn new(tile_grid: (u32, u32), tile_size: (u32, u32)) -> Self {
        Self {
            tile_grid,
            tile_size,
        }
    }

    /// Merge `tiles` (row-wise, north-west first, `None` for missing) into
    /// one image. Missing tiles stay background/transparent.
    pub fn merge(&self, tiles: &[Option<ImageSource>], opts: &ImageOptions) -> Result<ImageSource> {
        if self.tile_grid == (1, 1) {
            if let Some(Some(tile)) = tiles.first() {
                return Ok(tile.clone());
            }
        }

        let size = (
            self.tile_grid.0 * self.tile_size.0,
            self.tile_grid.1 * self.tile_size.1,
        );
        let mut result = create_image(size, opts).to_rgba8();

        for (i, source) in tiles.iter().enumerate() {
            let Some(source) = source else { continue };
            let img = match source.as_image() {
                Ok(img) => img,
                Err(err) => {
                    // a single broken tile must not break the whole mosaic
                    warn!(tile = i, %err, "unable to load tile for merge");
                    continue;
                }
            };
            let (x, y) = self.tile_offset(i as u32);
            imageops::replace(&mut result, &img.to_rgba8(), x as i64, y as i64);
        }

        Ok(ImageSource::from_image(
            DynamicImage::ImageRgba8(result),
            opts.format,
        ))
    }

    /// Pixel offset of the i-th tile, row-wise from the upper left
    fn tile_offset(&self, i: u32) -> (u32, u32) {
        (
            i % self.tile_grid.0 * self.tile_size.0,
            i / self.tile_grid.0 * self.tile_size.1,
        )
    }
}

/// Splits a meta tile image into individual tiles via pixel crops
pub struct TileSplitter {
    meta_img: Arc<DynamicImage>,
    format: TileFormat,
}

impl TileSplitter {
    /// Prepare splitting of `meta_tile`
    pub fn new(meta_tile: &ImageSource, format: TileFormat) -> Result<Self> {
        Ok(Self {
            meta_img: meta_tile.as_image()?,
            format,
        })
    }

    /// The tile whose upper-left corner sits at `crop` within the meta image
    pub fn get_tile(&self, crop: (u32, u32), tile_size: (u32, u32)) -> ImageSource {
        let tile = self
            .meta_img
            .crop_imm(crop.0, crop.1, tile_size.0, tile_size.1);
        ImageSource::from_image(tile, self.format)
    }
}

/// An image assembled from multiple tiles, placed in map space
#[derive(Debug)]
pub struct TiledImage {
    tiles: Vec<Option<ImageSource>>,
    tile_grid: (u32, u32),
    tile_size: (u32, u32),
    src_bbox: BBox,
}

impl TiledImage {
    /// `tiles` row-wise from the north-west corner, `None` for missing
    pub fn new(
        tiles: Vec<Option<ImageSource>>,
        tile_grid: (u32, u32),
        tile_size: (u32, u32),
        src_bbox: BBox,
    ) -> Self {
        Self {
            tiles,
            tile_grid,
            tile_size,
            src_bbox,
        }
    }

    /// All tiles merged into one image
    pub fn image(&self, opts: &ImageOptions) -> Result<ImageSource> {
        TileMerger::new(self.tile_grid, self.tile_size).merge(&self.tiles, opts)
    }

    /// Merge and transform into `req_bbox` at `out_size`
    pub fn transform(
        &self,
        req_bbox: &BBox,
        out_size: (u32, u32),
        opts: &ImageOptions,
    ) -> Result<ImageSource> {
        let src_img = self.image(opts)?;
        ImageTransformer::new(opts.resampling).transform(
            &src_img,
            &self.src_bbox,
            out_size,
            req_bbox,
            opts,
        )
    }
}
