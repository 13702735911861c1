//! The polymorphic storage backend contract

use async_trait::async_trait;
use tilekeep_grid::Coverage;

use crate::error::CacheResult;
use crate::tile::Tile;

/// Returns true for tiles that need no backend access: sentinels and
/// tiles whose payload is already present.
pub(crate) fn already_available(tile: &Tile) -> bool {
    tile.coord.is_none() || tile.source.is_some()
}

/// Contract implemented by every storage backend.
///
/// Loads return `Ok(false)` for absent tiles and only fail on corruption
/// or unreachable backends. Stores may return `Ok(false)` when the backend
/// is busy; the caller must then not treat the tile as stored.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Stable identifier used to derive lock file names
    fn lock_cache_id(&self) -> &str;

    /// Polygon restricting which tiles are considered part of the cache
    fn coverage(&self) -> Option<&Coverage> {
        None
    }

    /// False for backends that cannot report tile timestamps
    fn supports_timestamp(&self) -> bool {
        true
    }

    /// True if the tile needs no fetch: sentinel, payload present, or
    /// present in the backend
    async fn is_cached(&self, tile: &Tile) -> CacheResult<bool>;

    /// Fill `tile.source` from the backend. Returns true if the tile
    /// needed no load or was loaded; false if it is absent.
    async fn load_tile(&self, tile: &mut Tile, with_metadata: bool) -> CacheResult<bool>;

    /// Bulk load. Returns true iff every missing tile was loaded.
    async fn load_tiles(&self, tiles: &mut [Tile], with_metadata: bool) -> CacheResult<bool> {
        let mut all_loaded = true;
        for tile in tiles.iter_mut() {
            if !self.load_tile(tile, with_metadata).await? {
                all_loaded = false;
            }
        }
        Ok(all_loaded)
    }

    /// Write the tile payload. Returns true on success or when the tile
    /// was already stored; false when the backend is busy.
    async fn store_tile(&self, tile: &mut Tile) -> CacheResult<bool>;

    /// Bulk store. Payloads are encoded outside of any backend lock or
    /// transaction.
    async fn store_tiles(&self, tiles: &mut [Tile]) -> CacheResult<bool> {
        let mut all_stored = true;
        for tile in tiles.iter_mut() {
            if !self.store_tile(tile).await? {
                all_stored = false;
            }
        }
        Ok(all_stored)
    }

    /// Remove a tile; removing an absent tile succeeds
    async fn remove_tile(&self, tile: &mut Tile) -> CacheResult<bool>;

    /// Bulk remove
    async fn remove_tiles(&self, tiles: &mut [Tile]) -> CacheResult<()> {
        for tile in tiles.iter_mut() {
            self.remove_tile(tile).await?;
        }
        Ok(())
    }

    /// Fill `size` and `timestamp` without requiring the payload
    async fn load_tile_metadata(&self, tile: &mut Tile) -> CacheResult<()>;

    /// Remove all tiles of `level` older than `timestamp`; `None` removes
    /// the whole level. Returns true if the backend supports the request.
    async fn remove_level_tiles_before(
        &self,
        _level: u8,
        _timestamp: Option<f64>,
    ) -> CacheResult<bool> {
        Ok(false)
    }

    /// Release per-session resources (connections, handles)
    async fn cleanup(&self) {}
}
