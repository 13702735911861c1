//! The in-memory tile value and collections of tiles

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tilekeep_grid::TileCoord;
use tilekeep_image::{ImageSource, TileFormat};

use crate::error::CacheResult;

/// Seconds since epoch as float
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One tile: coordinate plus (optional) raster payload and metadata.
///
/// A tile with a `None` coordinate is a sentinel for "outside the cached
/// area": it is treated as already cached, never fetched and never stored.
#[derive(Debug, Clone, Default)]
pub struct Tile {
    /// Grid position, `None` for out-of-area sentinels
    pub coord: Option<TileCoord>,
    /// Raster payload; `None` until loaded or created
    pub source: Option<ImageSource>,
    /// Set once the payload has been written to the backend
    pub stored: bool,
    /// False for tiles that must not be persisted (e.g. blank fallbacks)
    pub cacheable: bool,
    /// Size of the encoded payload in bytes
    pub size: Option<u64>,
    /// Backend timestamp, seconds since epoch
    pub timestamp: Option<f64>,
    /// Backend-assigned location, memoized by the file backend
    pub(crate) location: Option<PathBuf>,
}

impl Tile {
    /// New tile without payload
    pub fn new(coord: impl Into<Option<TileCoord>>) -> Self {
        Self {
            coord: coord.into(),
            cacheable: true,
            ..Default::default()
        }
    }

    /// New tile carrying a payload
    pub fn with_source(coord: impl Into<Option<TileCoord>>, source: ImageSource) -> Self {
        Self {
            coord: coord.into(),
            source: Some(source),
            cacheable: true,
            ..Default::default()
        }
    }

    /// True when the tile has a coordinate but no payload yet.
    /// Sentinel tiles (`coord == None`) are never missing.
    pub fn is_missing(&self) -> bool {
        self.coord.is_some() && self.source.is_none()
    }

    /// Encode the payload for storage and update `size` and `timestamp`.
    ///
    /// Encoding happens before any backend lock or transaction is taken;
    /// callers mark the tile as `stored` once the write succeeded.
    pub fn encode_for_store(&mut self, format: Option<TileFormat>) -> CacheResult<Bytes> {
        let source = self
            .source
            .as_ref()
            .expect("store requires a tile payload");
        let data = source.as_bytes(format)?;
        self.size = Some(data.len() as u64);
        self.timestamp = Some(now_timestamp());
        Ok(data)
    }

    /// Memoized backend location
    pub(crate) fn location_or_insert(&mut self, compute: impl FnOnce() -> PathBuf) -> PathBuf {
        self.location
            .get_or_insert_with(compute)
            .clone()
    }
}

impl PartialEq for Tile {
    /// Tiles are equal when they have the same coordinate and share the
    /// same payload
    fn eq(&self, other: &Self) -> bool {
        if self.coord != other.coord {
            return false;
        }
        match (&self.source, &other.source) {
            (None, None) => true,
            (Some(a), Some(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Ordered sequence of tiles with a coordinate index, used for bulk
/// loads and stores.
#[derive(Debug, Default)]
pub struct TileCollection {
    tiles: Vec<Tile>,
    index: HashMap<TileCoord, usize>,
}

impl TileCollection {
    /// Collection from coordinates; `None` entries become sentinel tiles
    pub fn new(coords: Vec<Option<TileCoord>>) -> Self {
        let mut tiles = Vec::with_capacity(coords.len());
        let mut index = HashMap::with_capacity(coords.len());
        for (i, coord) in coords.into_iter().enumerate() {
            if let Some(coord) = coord {
                index.insert(coord, i);
            }
            tiles.push(Tile::new(coord));
        }
        Self { tiles, index }
    }

    /// Collection from plain coordinates
    pub fn from_coords(coords: &[TileCoord]) -> Self {
        Self::new(coords.iter().map(|c| Some(*c)).collect())
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// True if no tile in the collection carries a payload
    pub fn blank(&self) -> bool {
        self.tiles.iter().all(|t| t.source.is_none())
    }

    pub fn contains_coord(&self, coord: TileCoord) -> bool {
        self.index.contains_key(&coord)
    }

    /// Containment by tile coordinate
    pub fn contains(&self, tile: &Tile) -> bool {
        tile.coord.is_some_and(|coord| self.contains_coord(coord))
    }

    pub fn get(&self, i: usize) -> Option<&Tile> {
        self.tiles.get(i)
    }

    pub fn get_by_coord(&self, coord: TileCoord) -> Option<&Tile> {
        self.index.get(&coord).map(|&i| &self.tiles[i])
    }

    pub fn get_by_coord_mut(&mut self, coord: TileCoord) -> Option<&mut Tile> {
        self.index.get(&coord).map(|&i| &mut self.tiles[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tile> {
        self.tiles.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Tile> {
        self.tiles.iter_mut()
    }

    pub fn as_mut_slice(&mut self) -> &mut [Tile] {
        &mut self.tiles
    }

    pub fn into_vec(self) -> Vec<Tile> {
        self.tiles
    }
}

impl<'a> IntoIterator for &'a TileCollection {
    type Item = &'a Tile;
    type IntoIter = std::slice::Iter<'a, Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}

impl IntoIterator for TileCollection {
    type Item = Tile;
    type IntoIter = std::vec::IntoIter<Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.into_iter()
    }
}
