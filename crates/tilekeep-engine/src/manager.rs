//! Top-level tile orchestration: cache lookup, creation, rescaling,
//! coverage handling and expiry

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tilekeep_cache::{
    CacheResult, DummyCache, DummyLocker, LockGuard, Locker, Tile, TileCollection, TileStore,
};
use tilekeep_grid::{MetaGrid, TileCoord, TileGrid};
use tilekeep_image::{
    mask::mask_image_source_from_coverage, BandMerger, ImageOptions, ImageSource, TileFormat,
    TiledImage,
};
use tracing::debug;

use crate::creator::TileCreator;
use crate::error::{EngineError, Result};
use crate::source::MapSource;

/// Expiry policy: when is a cached tile considered stale?
#[derive(Debug, Clone, Copy)]
pub enum ExpirePolicy {
    /// Tiles stored at or before this unix timestamp are stale
    Timestamp(f64),
    /// Tiles stored at or before this point in time are stale
    RefreshBefore(chrono::DateTime<chrono::Utc>),
    /// Tiles older than this many seconds are stale
    RefreshBeforeSeconds(f64),
}

impl ExpirePolicy {
    /// The timestamp up to which tiles count as expired, evaluated now
    fn max_mtime(&self) -> f64 {
        match self {
            ExpirePolicy::Timestamp(ts) => *ts,
            ExpirePolicy::RefreshBefore(time) => time.timestamp() as f64,
            ExpirePolicy::RefreshBeforeSeconds(seconds) => {
                tilekeep_cache::now_timestamp() - seconds
            }
        }
    }
}

/// Filter applied to every tile before it is stored
pub trait TileFilter: Send + Sync {
    /// Return the (possibly replaced) tile
    fn apply(&self, tile: Tile) -> Result<Tile>;
}

/// Builder for [`TileManager`]; configuration errors surface here and
/// never at request time.
pub struct TileManagerBuilder {
    grid: Arc<TileGrid>,
    cache: Arc<dyn TileStore>,
    format: TileFormat,
    request_format: Option<TileFormat>,
    sources: Vec<Arc<dyn MapSource>>,
    locker: Arc<dyn Locker>,
    image_opts: Option<ImageOptions>,
    meta_size: Option<(u32, u32)>,
    meta_buffer: u32,
    minimize_meta_requests: bool,
    bulk_meta_tiles: bool,
    concurrent_tile_creators: usize,
    upscale_tiles: u8,
    downscale_tiles: u8,
    cache_rescaled_tiles: bool,
    disable_storage: bool,
    expire_policy: Option<ExpirePolicy>,
    pre_store_filters: Vec<Arc<dyn TileFilter>>,
    band_merger: Option<BandMerger>,
    identifier: Option<String>,
}

impl TileManagerBuilder {
    pub fn sources(mut self, sources: Vec<Arc<dyn MapSource>>) -> Self {
        self.sources = sources;
        self
    }

    /// Add one upstream source
    pub fn source(mut self, source: Arc<dyn MapSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = locker;
        self
    }

    pub fn image_opts(mut self, opts: ImageOptions) -> Self {
        self.image_opts = Some(opts);
        self
    }

    /// Format used for upstream requests when it differs from the cache
    /// format
    pub fn request_format(mut self, format: TileFormat) -> Self {
        self.request_format = Some(format);
        self
    }

    /// Combine `w x h` tiles into one upstream request
    pub fn meta_size(mut self, meta_size: (u32, u32)) -> Self {
        self.meta_size = Some(meta_size);
        self
    }

    /// Buffer around meta tiles in pixels
    pub fn meta_buffer(mut self, meta_buffer: u32) -> Self {
        self.meta_buffer = meta_buffer;
        self
    }

    /// Answer multi-tile requests with a single minimal meta request
    pub fn minimize_meta_requests(mut self, enabled: bool) -> Self {
        self.minimize_meta_requests = enabled;
        self
    }

    /// Fetch meta-tile blocks tile-by-tile from upstream tile caches
    pub fn bulk_meta_tiles(mut self, enabled: bool) -> Self {
        self.bulk_meta_tiles = enabled;
        self
    }

    pub fn concurrent_tile_creators(mut self, n: usize) -> Self {
        self.concurrent_tile_creators = n.max(1);
        self
    }

    /// On miss, scale up from tiles up to `n` levels below
    pub fn upscale_tiles(mut self, n: u8) -> Self {
        self.upscale_tiles = n;
        self
    }

    /// On miss, scale down from tiles up to `n` levels above
    pub fn downscale_tiles(mut self, n: u8) -> Self {
        self.downscale_tiles = n;
        self
    }

    /// Persist tiles produced by rescaling
    pub fn cache_rescaled_tiles(mut self, enabled: bool) -> Self {
        self.cache_rescaled_tiles = enabled;
        self
    }

    /// Substitute a no-op backend; every request hits the sources
    pub fn disable_storage(mut self, disabled: bool) -> Self {
        self.disable_storage = disabled;
        self
    }

    pub fn expire_policy(mut self, policy: ExpirePolicy) -> Self {
        self.expire_policy = Some(policy);
        self
    }

    pub fn pre_store_filter(mut self, filter: Arc<dyn TileFilter>) -> Self {
        self.pre_store_filters.push(filter);
        self
    }

    /// Compose tiles from selected bands of the sources instead of
    /// alpha compositing
    pub fn band_merger(mut self, merger: BandMerger) -> Self {
        self.band_merger = Some(merger);
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn build(self) -> Result<TileManager> {
        if self.upscale_tiles > 0 && self.downscale_tiles > 0 {
            return Err(EngineError::Configuration(
                "upscale_tiles and downscale_tiles are mutually exclusive".to_string(),
            ));
        }

        let cache: Arc<dyn TileStore> = if self.disable_storage {
            Arc::new(DummyCache)
        } else {
            self.cache
        };
        let locker: Arc<dyn Locker> = if self.disable_storage {
            Arc::new(DummyLocker)
        } else {
            self.locker
        };

        if self.expire_policy.is_some() && !cache.supports_timestamp() {
            return Err(EngineError::Configuration(
                "expiry policy configured but the backend records no timestamps".to_string(),
            ));
        }

        let wants_meta = self.meta_buffer > 0
            || self
                .meta_size
                .is_some_and(|meta_size| meta_size != (1, 1));
        let meta_grid = if wants_meta {
            let meta_size = self.meta_size.unwrap_or((1, 1));
            let all_meta = self.sources.iter().all(|s| s.supports_meta_tiles());
            let any_meta = self.sources.iter().any(|s| s.supports_meta_tiles());
            if all_meta && !self.sources.is_empty() {
                Some(MetaGrid::new(
                    self.grid.clone(),
                    meta_size,
                    self.meta_buffer,
                )?)
            } else if any_meta {
                return Err(EngineError::Configuration(
                    "meta tiling configured but not supported by all sources".to_string(),
                ));
            } else if self.bulk_meta_tiles {
                // all sources are tiled: fetch blocks tile-by-tile
                Some(MetaGrid::new(self.grid.clone(), meta_size, 0)?)
            } else {
                None
            }
        } else {
            None
        };

        if self.bulk_meta_tiles
            && !self.sources.is_empty()
            && !self.sources.iter().all(|s| s.tile_access().is_some())
        {
            return Err(EngineError::Configuration(
                "bulk_meta_tiles requires tile cache sources".to_string(),
            ));
        }

        let rescale_tiles = if self.upscale_tiles > 0 {
            -(self.upscale_tiles as i32)
        } else {
            self.downscale_tiles as i32
        };

        Ok(TileManager {
            grid: self.grid,
            meta_grid,
            cache,
            locker,
            sources: self.sources,
            format: self.format,
            request_format: self.request_format.unwrap_or(self.format),
            image_opts: self.image_opts.unwrap_or_default(),
            minimize_meta_requests: self.minimize_meta_requests,
            bulk_meta_tiles: self.bulk_meta_tiles,
            concurrent_tile_creators: self.concurrent_tile_creators,
            rescale_tiles,
            cache_rescaled_tiles: self.cache_rescaled_tiles,
            expire_policy: self.expire_policy,
            pre_store_filters: self.pre_store_filters,
            band_merger: self.band_merger,
            identifier: self.identifier,
        })
    }
}

/// Manages tiles for a single grid: loads tiles from the cache, creates
/// missing tiles from the sources and stores them, rescales from adjacent
/// levels, and applies coverage and expiry rules.
pub struct TileManager {
    grid: Arc<TileGrid>,
    meta_grid: Option<MetaGrid>,
    cache: Arc<dyn TileStore>,
    locker: Arc<dyn Locker>,
    sources: Vec<Arc<dyn MapSource>>,
    format: TileFormat,
    request_format: TileFormat,
    image_opts: ImageOptions,
    minimize_meta_requests: bool,
    bulk_meta_tiles: bool,
    concurrent_tile_creators: usize,
    /// Negative: scale up from lower levels; positive: scale down
    rescale_tiles: i32,
    cache_rescaled_tiles: bool,
    expire_policy: Option<ExpirePolicy>,
    pre_store_filters: Vec<Arc<dyn TileFilter>>,
    band_merger: Option<BandMerger>,
    identifier: Option<String>,
}

impl TileManager {
    /// Start building a manager for `grid` storing `format` tiles in
    /// `cache`
    pub fn builder(
        grid: Arc<TileGrid>,
        cache: Arc<dyn TileStore>,
        format: TileFormat,
    ) -> TileManagerBuilder {
        TileManagerBuilder {
            grid,
            cache,
            format,
            request_format: None,
            sources: Vec::new(),
            locker: Arc::new(DummyLocker),
            image_opts: None,
            meta_size: None,
            meta_buffer: 0,
            minimize_meta_requests: false,
            bulk_meta_tiles: false,
            concurrent_tile_creators: 1,
            upscale_tiles: 0,
            downscale_tiles: 0,
            cache_rescaled_tiles: false,
            disable_storage: false,
            expire_policy: None,
            pre_store_filters: Vec::new(),
            band_merger: None,
            identifier: None,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub(crate) fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub(crate) fn meta_grid(&self) -> Option<&MetaGrid> {
        self.meta_grid.as_ref()
    }

    pub(crate) fn cache(&self) -> &dyn TileStore {
        self.cache.as_ref()
    }

    pub(crate) fn sources(&self) -> &[Arc<dyn MapSource>] {
        &self.sources
    }

    pub(crate) fn image_opts(&self) -> &ImageOptions {
        &self.image_opts
    }

    pub(crate) fn format(&self) -> TileFormat {
        self.format
    }

    pub(crate) fn request_format(&self) -> TileFormat {
        self.request_format
    }

    pub(crate) fn minimize_meta_requests(&self) -> bool {
        self.minimize_meta_requests
    }

    pub(crate) fn bulk_meta_tiles(&self) -> bool {
        self.bulk_meta_tiles
    }

    pub(crate) fn concurrent_tile_creators(&self) -> usize {
        self.concurrent_tile_creators
    }

    pub(crate) fn band_merger(&self) -> Option<&BandMerger> {
        self.band_merger.as_ref()
    }

    /// Lock for `coord`; with meta tiling the meta tile's main tile
    /// serializes all of its sub-tiles.
    pub(crate) async fn lock(&self, coord: TileCoord) -> CacheResult<LockGuard> {
        let coord = match &self.meta_grid {
            Some(meta_grid) => meta_grid.main_tile(coord),
            None => coord,
        };
        self.locker.lock(coord).await
    }

    /// Load a single tile
    pub async fn load_tile_coord(
        &self,
        coord: TileCoord,
        with_metadata: bool,
    ) -> Result<Tile> {
        let tiles = self.load_tile_coords(&[coord], with_metadata).await?;
        Ok(tiles.into_iter().next().expect("one tile per coord"))
    }

    /// Load tiles from the cache, creating or rescaling what is missing
    pub async fn load_tile_coords(
        &self,
        coords: &[TileCoord],
        with_metadata: bool,
    ) -> Result<TileCollection> {
        // clamp the rescale limit to the grid
        let rescale_till_zoom = if self.rescale_tiles != 0 {
            coords.first().map(|coord| {
                (coord.z as i32 + self.rescale_tiles).clamp(0, self.grid.levels() as i32 - 1)
                    as u8
            })
        } else {
            None
        };

        // tiles outside the cache coverage turn into sentinels
        let mut wanted: Vec<Option<TileCoord>> = Vec::with_capacity(coords.len());
        for coord in coords {
            let inside = match self.cache.coverage() {
                Some(coverage) => {
                    coverage.intersects(&self.grid.tile_bbox(*coord)?, self.grid.srs())?
                }
                None => true,
            };
            wanted.push(inside.then_some(*coord));
        }
        let mut tiles = TileCollection::new(wanted);

        let mut rescaled = HashMap::new();
        self.load_collection(&mut tiles, with_metadata, rescale_till_zoom, &mut rescaled)
            .await?;

        // clip partially covered tiles
        if let Some(coverage) = self.cache.coverage() {
            if coverage.clip() {
                for tile in tiles.iter_mut() {
                    let Some(coord) = tile.coord else { continue };
                    let Some(source) = tile.source.clone() else { continue };
                    let bbox = self.grid.tile_bbox(coord)?;
                    if coverage.intersects(&bbox, self.grid.srs())? {
                        tile.source = Some(mask_image_source_from_coverage(
                            &source,
                            &bbox,
                            self.grid.srs(),
                            coverage,
                            &ImageOptions::transparent_png(),
                        )?);
                    }
                }
            }
        }

        Ok(tiles)
    }

    /// Cache lookup, creation and rescale fallback for one collection.
    /// `rescaled` carries tiles already produced by the rescale recursion.
    fn load_collection<'a>(
        &'a self,
        tiles: &'a mut TileCollection,
        with_metadata: bool,
        rescale_till_zoom: Option<u8>,
        rescaled: &'a mut HashMap<TileCoord, Option<ImageSource>>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            for tile in tiles.iter_mut() {
                if let Some(coord) = tile.coord {
                    if let Some(entry) = rescaled.get(&coord) {
                        tile.source = entry.clone();
                    }
                }
            }

            self.cache.load_tiles(tiles.as_mut_slice(), with_metadata).await?;

            let cache_only = self.sources.is_empty();
            if cache_only && rescale_till_zoom.is_none() {
                return Ok(());
            }

            let mut uncached = Vec::new();
            for tile in tiles.iter() {
                let Some(coord) = tile.coord else { continue };
                if rescaled.contains_key(&coord) {
                    continue;
                }
                let missing = if cache_only {
                    tile.is_missing()
                } else {
                    // missing or stale
                    !self.is_cached_tile(tile).await?
                };
                if missing {
                    uncached.push(tile.clone());
                }
            }
            if uncached.is_empty() {
                return Ok(());
            }

            let created = if cache_only {
                Vec::new()
            } else {
                TileCreator::new(self).create_tiles(uncached.clone()).await?
            };

            if created.is_empty() {
                if let Some(stop_zoom) = rescale_till_zoom {
                    for tile in uncached {
                        let scaled = self.scaled_tile(tile, stop_zoom, rescaled).await?;
                        if let Some(coord) = scaled.coord {
                            if let Some(slot) = tiles.get_by_coord_mut(coord) {
                                slot.source = scaled.source.clone();
                            }
                        }
                    }
                }
                return Ok(());
            }

            for created_tile in created {
                if let Some(coord) = created_tile.coord {
                    if let Some(slot) = tiles.get_by_coord_mut(coord) {
                        slot.source = created_tile.source;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Produce `tile` by loading, rescaling and cropping tiles from the
    /// adjacent zoom level, recursing towards `stop_zoom`. Returns the
    /// tile unchanged (payload absent) when nothing can be rescaled.
    async fn scaled_tile(
        &self,
        mut tile: Tile,
        stop_zoom: u8,
        rescaled: &mut HashMap<TileCoord, Option<ImageSource>>,
    ) -> Result<Tile> {
        let coord = tile.coord.expect("rescaling needs a coordinate");
        if let Some(entry) = rescaled.get(&coord) {
            tile.source = entry.clone();
            return Ok(tile);
        }
        // mark as in-progress: a missing result must not be retried
        rescaled.insert(coord, None);

        if coord.z == stop_zoom {
            return Ok(tile);
        }
        let src_level = if stop_zoom > coord.z {
            coord.z + 1
        } else {
            coord.z - 1
        };

        let tile_bbox = self.grid.tile_bbox(coord)?;
        let (src_bbox, src_grid, affected_coords) =
            self.grid.affected_level_tiles(&tile_bbox, src_level)?;

        let mut affected = TileCollection::new(affected_coords);
        self.load_collection(&mut affected, false, Some(stop_zoom), rescaled)
            .await?;

        if affected.blank() {
            return Ok(tile);
        }

        debug!(%coord, src_level, "rescaling tile from adjacent level");
        let sources: Vec<Option<ImageSource>> =
            affected.iter().map(|t| t.source.clone()).collect();
        let tiled = TiledImage::new(sources, src_grid, self.grid.tile_size(), src_bbox);
        let img = tiled.transform(&tile_bbox, self.grid.tile_size(), &self.image_opts)?;

        rescaled.insert(coord, Some(img.clone()));
        tile.source = Some(img);

        if self.cache_rescaled_tiles {
            self.cache.store_tile(&mut tile).await?;
        }
        Ok(tile)
    }

    /// Remove tiles from the cache
    pub async fn remove_tile_coords(&self, coords: &[TileCoord]) -> Result<()> {
        let mut tiles = TileCollection::from_coords(coords);
        self.cache.remove_tiles(tiles.as_mut_slice()).await?;
        Ok(())
    }

    /// True if the tile is cached and, with an expiry policy, still fresh
    pub async fn is_cached(&self, coord: TileCoord) -> Result<bool> {
        self.is_cached_tile(&Tile::new(coord)).await
    }

    pub(crate) async fn is_cached_tile(&self, tile: &Tile) -> Result<bool> {
        if tile.coord.is_none() {
            return Ok(true);
        }
        let cached = self.cache.is_cached(tile).await?;
        if cached {
            if let Some(policy) = &self.expire_policy {
                let mut probe = Tile::new(tile.coord);
                self.cache.load_tile_metadata(&mut probe).await?;
                let timestamp = probe.timestamp.unwrap_or(0.0);
                if timestamp.floor() <= policy.max_mtime() {
                    return Ok(false);
                }
            }
        }
        Ok(cached)
    }

    /// True if the tile exists in the cache but is expired
    pub async fn is_stale(&self, coord: TileCoord) -> Result<bool> {
        let tile = Tile::new(coord);
        if self.cache.is_cached(&tile).await? {
            return Ok(!self.is_cached_tile(&tile).await?);
        }
        Ok(false)
    }

    /// Apply all `pre_store_filter` to this tile
    pub(crate) fn apply_tile_filters(&self, mut tile: Tile) -> Result<Tile> {
        if tile.stored {
            return Ok(tile);
        }
        for filter in &self.pre_store_filters {
            tile = filter.apply(tile)?;
        }
        Ok(tile)
    }

    /// Release per-session backend resources
    pub async fn cleanup(&self) {
        self.cache.cleanup().await;
    }

    /// Scoped access to the cache; call [`CacheSession::finish`] to
    /// release per-thread backend connections.
    pub fn session(&self) -> CacheSession<'_> {
        CacheSession { manager: self }
    }
}

/// Scoped acquisition of the manager's backend resources
pub struct CacheSession<'a> {
    manager: &'a TileManager,
}

impl<'a> CacheSession<'a> {
    /// The manager this session wraps
    pub fn manager(&self) -> &'a TileManager {
        self.manager
    }

    /// Run the backend cleanup and end the session
    pub async fn finish(self) {
        self.manager.cleanup().await;
    }
}

impl std::ops::Deref for CacheSession<'_> {
    type Target = TileManager;

    fn deref(&self) -> &Self::Target {
        self.manager
    }
}
