//! Tile pyramid: resolutions, grid sizes and bbox math

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bbox::BBox;
use crate::coord::{Srs, TileCoord};
use crate::error::{GridError, Result};
use crate::DEFAULT_TILE_SIZE;

/// Extent of Web Mercator in map units
const WEB_MERCATOR_EXTENT: f64 = 20037508.342789244;

/// Configuration for a [`TileGrid`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Spatial reference of the grid
    pub srs: Srs,
    /// Extent covered by the grid
    pub bbox: BBox,
    /// Tile size in pixels (width, height)
    pub tile_size: (u32, u32),
    /// Number of zoom levels; ignored when `resolutions` is set
    pub levels: u8,
    /// Explicit resolution per level (map units per pixel), highest first
    pub resolutions: Option<Vec<f64>>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            srs: Srs::WEB_MERCATOR,
            bbox: BBox::new(
                -WEB_MERCATOR_EXTENT,
                -WEB_MERCATOR_EXTENT,
                WEB_MERCATOR_EXTENT,
                WEB_MERCATOR_EXTENT,
            ),
            tile_size: (DEFAULT_TILE_SIZE, DEFAULT_TILE_SIZE),
            levels: 20,
            resolutions: None,
        }
    }
}

/// A tile pyramid with a fixed extent and one resolution per level.
///
/// Tiles are addressed with a south-west origin: `(0, 0, z)` is the
/// lower-left tile, row indices grow northwards.
#[derive(Debug, Clone)]
pub struct TileGrid {
    srs: Srs,
    bbox: BBox,
    tile_size: (u32, u32),
    resolutions: Vec<f64>,
    grid_sizes: Vec<(u32, u32)>,
}

impl TileGrid {
    /// Build a grid from its configuration
    pub fn new(config: GridConfig) -> Result<Self> {
        if config.bbox.width() <= 0.0 || config.bbox.height() <= 0.0 {
            return Err(GridError::InvalidGrid("empty bbox".to_string()));
        }
        if config.tile_size.0 == 0 || config.tile_size.1 == 0 {
            return Err(GridError::InvalidGrid("zero tile size".to_string()));
        }

        let resolutions = match config.resolutions {
            Some(res) => {
                if res.is_empty() {
                    return Err(GridError::InvalidGrid("no resolutions".to_string()));
                }
                if res.windows(2).any(|w| w[1] >= w[0]) {
                    return Err(GridError::InvalidGrid(
                        "resolutions must be descending".to_string(),
                    ));
                }
                res
            }
            None => {
                if config.levels == 0 {
                    return Err(GridError::InvalidGrid("zero levels".to_string()));
                }
                let res0 = (config.bbox.width() / config.tile_size.0 as f64)
                    .max(config.bbox.height() / config.tile_size.1 as f64);
                (0..config.levels)
                    .map(|z| res0 / (1u64 << z) as f64)
                    .collect()
            }
        };

        let grid_sizes = resolutions
            .iter()
            .map(|res| {
                let tw = res * config.tile_size.0 as f64;
                let th = res * config.tile_size.1 as f64;
                (
                    (config.bbox.width() / tw - 1e-9).ceil().max(1.0) as u32,
                    (config.bbox.height() / th - 1e-9).ceil().max(1.0) as u32,
                )
            })
            .collect();

        Ok(Self {
            srs: config.srs,
            bbox: config.bbox,
            tile_size: config.tile_size,
            resolutions,
            grid_sizes,
        })
    }

    /// Standard Web Mercator grid with 256px tiles
    pub fn web_mercator(levels: u8) -> Self {
        Self::new(GridConfig {
            levels,
            ..Default::default()
        })
        .expect("default web mercator grid is valid")
    }

    /// Spatial reference of the grid
    pub fn srs(&self) -> Srs {
        self.srs
    }

    /// Extent covered by the grid
    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    /// Tile size in pixels
    pub fn tile_size(&self) -> (u32, u32) {
        self.tile_size
    }

    /// Number of zoom levels
    pub fn levels(&self) -> u8 {
        self.resolutions.len() as u8
    }

    /// Resolution at `level` in map units per pixel
    pub fn resolution(&self, level: u8) -> Result<f64> {
        self.resolutions
            .get(level as usize)
            .copied()
            .ok_or(GridError::InvalidZoom {
                zoom: level,
                levels: self.levels(),
            })
    }

    /// Grid width/height in tiles at `level`
    pub fn grid_size(&self, level: u8) -> Result<(u32, u32)> {
        self.grid_sizes
            .get(level as usize)
            .copied()
            .ok_or(GridError::InvalidZoom {
                zoom: level,
                levels: self.levels(),
            })
    }

    /// True if the coordinate addresses a tile within the grid
    pub fn contains(&self, coord: TileCoord) -> bool {
        match self.grid_size(coord.z) {
            Ok((w, h)) => coord.x < w && coord.y < h,
            Err(_) => false,
        }
    }

    /// Bounding box of a single tile
    pub fn tile_bbox(&self, coord: TileCoord) -> Result<BBox> {
        let res = self.resolution(coord.z)?;
        let tw = res * self.tile_size.0 as f64;
        let th = res * self.tile_size.1 as f64;
        let minx = self.bbox.minx + coord.x as f64 * tw;
        let miny = self.bbox.miny + coord.y as f64 * th;
        Ok(BBox::new(minx, miny, minx + tw, miny + th))
    }

    /// Bounding box covering all `coords` (must share one level)
    pub fn tiles_bbox(&self, coords: &[TileCoord]) -> Result<BBox> {
        let mut iter = coords.iter();
        let first = iter
            .next()
            .ok_or_else(|| GridError::InvalidGrid("no tiles".to_string()))?;
        let mut bbox = self.tile_bbox(*first)?;
        for coord in iter {
            bbox = bbox.union(&self.tile_bbox(*coord)?);
        }
        Ok(bbox)
    }

    /// All tiles on `level` touched by `bbox`.
    ///
    /// Returns the tile-aligned bbox of the affected area, the size of the
    /// affected sub-grid and its coordinates ordered row-wise from
    /// north-west to south-east. Positions outside the grid are `None`.
    pub fn affected_level_tiles(
        &self,
        bbox: &BBox,
        level: u8,
    ) -> Result<(BBox, (u32, u32), Vec<Option<TileCoord>>)> {
        let res = self.resolution(level)?;
        let (grid_w, grid_h) = self.grid_size(level)?;
        let tw = res * self.tile_size.0 as f64;
        let th = res * self.tile_size.1 as f64;

        // nudge by a fraction of a pixel so bboxes aligned on tile
        // boundaries do not pick up their neighbors
        let delta = res / 10.0;

        let x0 = ((bbox.minx - self.bbox.minx + delta) / tw).floor() as i64;
        let y0 = ((bbox.miny - self.bbox.miny + delta) / th).floor() as i64;
        let mut x1 = ((bbox.maxx - self.bbox.minx - delta) / tw).ceil() as i64 - 1;
        let mut y1 = ((bbox.maxy - self.bbox.miny - delta) / th).ceil() as i64 - 1;
        x1 = x1.max(x0);
        y1 = y1.max(y0);

        let aligned = BBox::new(
            self.bbox.minx + x0 as f64 * tw,
            self.bbox.miny + y0 as f64 * th,
            self.bbox.minx + (x1 + 1) as f64 * tw,
            self.bbox.miny + (y1 + 1) as f64 * th,
        );
        let size = ((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);

        let mut coords = Vec::with_capacity((size.0 * size.1) as usize);
        let mut outside = 0usize;
        for y in (y0..=y1).rev() {
            for x in x0..=x1 {
                if x >= 0 && y >= 0 && (x as u32) < grid_w && (y as u32) < grid_h {
                    coords.push(Some(TileCoord::new(x as u32, y as u32, level)));
                } else {
                    coords.push(None);
                    outside += 1;
                }
            }
        }
        if outside > 0 {
            debug!(level, outside, "affected area extends beyond the grid");
        }

        Ok((aligned, size, coords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_resolutions_halve() {
        let grid = TileGrid::web_mercator(20);
        let r0 = grid.resolution(0).unwrap();
        let r1 = grid.resolution(1).unwrap();
        assert_relative_eq!(r0 / 2.0, r1);
        assert_eq!(grid.grid_size(0).unwrap(), (1, 1));
        assert_eq!(grid.grid_size(2).unwrap(), (4, 4));
    }

    #[test]
    fn test_tile_bbox_roundtrip() {
        let grid = TileGrid::web_mercator(20);
        let bbox = grid.tile_bbox(TileCoord::new(0, 0, 1)).unwrap();
        assert_relative_eq!(bbox.minx, -WEB_MERCATOR_EXTENT);
        assert_relative_eq!(bbox.maxx, 0.0);
        assert_relative_eq!(bbox.miny, -WEB_MERCATOR_EXTENT);
        assert_relative_eq!(bbox.maxy, 0.0);
    }

    #[test]
    fn test_affected_level_tiles_single() {
        let grid = TileGrid::web_mercator(20);
        let tile_bbox = grid.tile_bbox(TileCoord::new(1, 2, 2)).unwrap();
        let (aligned, size, coords) = grid.affected_level_tiles(&tile_bbox, 2).unwrap();
        assert_eq!(size, (1, 1));
        assert_eq!(coords, vec![Some(TileCoord::new(1, 2, 2))]);
        assert!(aligned.approx_eq(&tile_bbox, 1e-6, 1e-6));
    }

    #[test]
    fn test_affected_level_tiles_children() {
        // the bbox of one z1 tile covers a 2x2 block on z2
        let grid = TileGrid::web_mercator(20);
        let tile_bbox = grid.tile_bbox(TileCoord::new(0, 1, 1)).unwrap();
        let (_, size, coords) = grid.affected_level_tiles(&tile_bbox, 2).unwrap();
        assert_eq!(size, (2, 2));
        // row-wise from the north-west corner
        assert_eq!(
            coords,
            vec![
                Some(TileCoord::new(0, 3, 2)),
                Some(TileCoord::new(1, 3, 2)),
                Some(TileCoord::new(0, 2, 2)),
                Some(TileCoord::new(1, 2, 2)),
            ]
        );
    }

    #[test]
    fn test_affected_level_tiles_parent() {
        let grid = TileGrid::web_mercator(20);
        let tile_bbox = grid.tile_bbox(TileCoord::new(3, 1, 2)).unwrap();
        let (_, size, coords) = grid.affected_level_tiles(&tile_bbox, 1).unwrap();
        assert_eq!(size, (1, 1));
        assert_eq!(coords, vec![Some(TileCoord::new(1, 0, 1))]);
    }

    #[test]
    fn test_contains() {
        let grid = TileGrid::web_mercator(3);
        assert!(grid.contains(TileCoord::new(3, 3, 2)));
        assert!(!grid.contains(TileCoord::new(4, 0, 2)));
        assert!(!grid.contains(TileCoord::new(0, 0, 3)));
    }

    #[test]
    fn test_invalid_config() {
        let config = GridConfig {
            resolutions: Some(vec![10.0, 20.0]),
            ..Default::default()
        };
        assert!(TileGrid::new(config).is_err());
    }
}
