//! Meta-tiling: combining blocks of tiles into single upstream requests

use std::sync::Arc;

use crate::bbox::BBox;
use crate::coord::TileCoord;
use crate::error::{GridError, Result};
use crate::grid::TileGrid;

/// A rectangular block of tiles fetched with one upstream request
#[derive(Debug, Clone)]
pub struct MetaTile {
    /// Map extent of the meta tile, including buffer
    pub bbox: BBox,
    /// Pixel size of the meta tile image
    pub size: (u32, u32),
    /// Size of the tile block (columns, rows)
    pub grid_size: (u32, u32),
    /// Tile coordinates row-wise from north-west to south-east;
    /// `None` for positions outside the grid
    pub tiles: Vec<Option<TileCoord>>,
    /// Crop positions: tile coordinate and the pixel position of its
    /// upper-left corner within the meta tile image
    pub tile_patterns: Vec<(TileCoord, (u32, u32))>,
    /// Tile whose lock serializes work on this meta tile
    pub main_coord: TileCoord,
}

impl MetaTile {
    /// All tile coordinates within the grid
    pub fn tile_coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        self.tiles.iter().filter_map(|t| *t)
    }
}

/// Derives meta tiles from a [`TileGrid`].
///
/// A meta tile covers `meta_size` tiles plus `meta_buffer` pixels on every
/// side (clipped at the grid edges). The buffer gives upstream renderers
/// context so labels and symbols do not get cut at tile borders.
#[derive(Debug, Clone)]
pub struct MetaGrid {
    grid: Arc<TileGrid>,
    meta_size: (u32, u32),
    meta_buffer: u32,
}

impl MetaGrid {
    /// Create a meta grid covering `meta_size` tiles per request
    pub fn new(grid: Arc<TileGrid>, meta_size: (u32, u32), meta_buffer: u32) -> Result<Self> {
        if meta_size.0 == 0 || meta_size.1 == 0 {
            return Err(GridError::InvalidGrid("zero meta size".to_string()));
        }
        Ok(Self {
            grid,
            meta_size,
            meta_buffer,
        })
    }

    /// Tiles per meta tile (columns, rows)
    pub fn meta_size(&self) -> (u32, u32) {
        self.meta_size
    }

    /// The tile that serializes all work on `coord`'s meta tile
    pub fn main_tile(&self, coord: TileCoord) -> TileCoord {
        TileCoord::new(
            coord.x / self.meta_size.0 * self.meta_size.0,
            coord.y / self.meta_size.1 * self.meta_size.1,
            coord.z,
        )
    }

    /// The meta tile containing `coord`
    pub fn meta_tile(&self, coord: TileCoord) -> Result<MetaTile> {
        let main = self.main_tile(coord);
        self.build(
            main.x,
            main.y,
            main.x + self.meta_size.0 - 1,
            main.y + self.meta_size.1 - 1,
            coord.z,
        )
    }

    /// The smallest buffered meta tile covering all `coords`
    pub fn minimal_meta_tile(&self, coords: &[TileCoord]) -> Result<MetaTile> {
        let first = coords
            .first()
            .ok_or_else(|| GridError::InvalidGrid("no tiles".to_string()))?;
        let mut x0 = first.x;
        let mut y0 = first.y;
        let mut x1 = first.x;
        let mut y1 = first.y;
        for c in coords {
            x0 = x0.min(c.x);
            y0 = y0.min(c.y);
            x1 = x1.max(c.x);
            y1 = y1.max(c.y);
        }
        self.build(x0, y0, x1, y1, first.z)
    }

    fn build(&self, x0: u32, y0: u32, x1: u32, y1: u32, z: u8) -> Result<MetaTile> {
        let res = self.grid.resolution(z)?;
        let (grid_w, grid_h) = self.grid.grid_size(z)?;
        let (tile_w, tile_h) = self.grid.tile_size();
        let tw = res * tile_w as f64;
        let th = res * tile_h as f64;
        let grid_bbox = self.grid.bbox();

        let unbuffered = BBox::new(
            grid_bbox.minx + x0 as f64 * tw,
            grid_bbox.miny + y0 as f64 * th,
            grid_bbox.minx + (x1 + 1) as f64 * tw,
            grid_bbox.miny + (y1 + 1) as f64 * th,
        );

        // buffer is clipped at the grid extent; edge tiles that stick out
        // beyond the extent keep their full footprint
        let buffer = self.meta_buffer as f64 * res;
        let bbox = BBox::new(
            (unbuffered.minx - buffer).max(grid_bbox.minx.min(unbuffered.minx)),
            (unbuffered.miny - buffer).max(grid_bbox.miny.min(unbuffered.miny)),
            (unbuffered.maxx + buffer).min(grid_bbox.maxx.max(unbuffered.maxx)),
            (unbuffered.maxy + buffer).min(grid_bbox.maxy.max(unbuffered.maxy)),
        );

        let size = (
            (bbox.width() / res).round() as u32,
            (bbox.height() / res).round() as u32,
        );

        let mut tiles = Vec::with_capacity(((x1 - x0 + 1) * (y1 - y0 + 1)) as usize);
        let mut tile_patterns = Vec::new();
        for y in (y0..=y1).rev() {
            for x in x0..=x1 {
                if x < grid_w && y < grid_h {
                    let coord = TileCoord::new(x, y, z);
                    tiles.push(Some(coord));
                    let tile_bbox = self.grid.tile_bbox(coord)?;
                    let px = ((tile_bbox.minx - bbox.minx) / res).round() as u32;
                    let py = ((bbox.maxy - tile_bbox.maxy) / res).round() as u32;
                    tile_patterns.push((coord, (px, py)));
                } else {
                    tiles.push(None);
                }
            }
        }

        Ok(MetaTile {
            bbox,
            size,
            grid_size: (x1 - x0 + 1, y1 - y0 + 1),
            tiles,
            tile_patterns,
            main_coord: self.main_tile(TileCoord::new(x0, y0, z)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_grid() -> MetaGrid {
        MetaGrid::new(Arc::new(TileGrid::web_mercator(20)), (2, 2), 0).unwrap()
    }

    #[test]
    fn test_main_tile() {
        let mg = meta_grid();
        assert_eq!(mg.main_tile(TileCoord::new(0, 0, 2)), TileCoord::new(0, 0, 2));
        assert_eq!(mg.main_tile(TileCoord::new(1, 1, 2)), TileCoord::new(0, 0, 2));
        assert_eq!(mg.main_tile(TileCoord::new(3, 2, 2)), TileCoord::new(2, 2, 2));
    }

    #[test]
    fn test_meta_tile_level1() {
        let mg = meta_grid();
        let meta = mg.meta_tile(TileCoord::new(0, 0, 1)).unwrap();
        assert_eq!(meta.grid_size, (2, 2));
        assert_eq!(meta.size, (512, 512));
        assert_eq!(meta.main_coord, TileCoord::new(0, 0, 1));
        // whole level: bbox equals the grid bbox
        let grid = TileGrid::web_mercator(20);
        assert!(meta.bbox.approx_eq(&grid.bbox(), 1e-6, 1e-6));
        assert_eq!(
            meta.tiles,
            vec![
                Some(TileCoord::new(0, 1, 1)),
                Some(TileCoord::new(1, 1, 1)),
                Some(TileCoord::new(0, 0, 1)),
                Some(TileCoord::new(1, 0, 1)),
            ]
        );
        // crop positions row-wise from the north-west
        assert_eq!(
            meta.tile_patterns,
            vec![
                (TileCoord::new(0, 1, 1), (0, 0)),
                (TileCoord::new(1, 1, 1), (256, 0)),
                (TileCoord::new(0, 0, 1), (0, 256)),
                (TileCoord::new(1, 0, 1), (256, 256)),
            ]
        );
    }

    #[test]
    fn test_meta_tile_buffer() {
        let mg = MetaGrid::new(Arc::new(TileGrid::web_mercator(20)), (2, 2), 10).unwrap();
        let meta = mg.meta_tile(TileCoord::new(2, 2, 3)).unwrap();
        // interior meta tile gets the full buffer on all sides
        assert_eq!(meta.size, (532, 532));
        assert_eq!(meta.tile_patterns[0].1, (10, 10));

        // at the grid corner the buffer is clipped on two sides
        let corner = mg.meta_tile(TileCoord::new(0, 7, 3)).unwrap();
        assert_eq!(corner.size, (522, 522));
        assert_eq!(corner.tile_patterns[0].1, (0, 0));
    }

    #[test]
    fn test_minimal_meta_tile() {
        let mg = meta_grid();
        let meta = mg
            .minimal_meta_tile(&[TileCoord::new(1, 1, 3), TileCoord::new(2, 1, 3)])
            .unwrap();
        assert_eq!(meta.grid_size, (2, 1));
        assert_eq!(meta.size, (512, 256));
        assert_eq!(meta.tile_coords().count(), 2);
    }

    #[test]
    fn test_meta_tile_at_grid_edge() {
        // level 0 has a single tile; the 2x2 block sticks out of the grid
        let mg = meta_grid();
        let meta = mg.meta_tile(TileCoord::new(0, 0, 0)).unwrap();
        assert_eq!(meta.grid_size, (2, 2));
        assert_eq!(meta.tile_coords().count(), 1);
        assert_eq!(meta.tile_patterns.len(), 1);
    }
}
