//! No-op backend substituted when storage is disabled

use async_trait::async_trait;

use crate::error::CacheResult;
use crate::store::{already_available, TileStore};
use crate::tile::Tile;

/// Backend that stores nothing and caches nothing.
///
/// Used with `disable_storage`: the manager keeps fetching from upstream
/// on every request while the rest of the pipeline stays unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyCache;

#[async_trait]
impl TileStore for DummyCache {
    fn lock_cache_id(&self) -> &str {
        "dummy"
    }

    async fn is_cached(&self, _tile: &Tile) -> CacheResult<bool> {
        Ok(false)
    }

    async fn load_tile(&self, tile: &mut Tile, _with_metadata: bool) -> CacheResult<bool> {
        Ok(already_available(tile))
    }

    async fn store_tile(&self, _tile: &mut Tile) -> CacheResult<bool> {
        Ok(true)
    }

    async fn remove_tile(&self, _tile: &mut Tile) -> CacheResult<bool> {
        Ok(true)
    }

    async fn load_tile_metadata(&self, _tile: &mut Tile) -> CacheResult<()> {
        Ok(())
    }
}
