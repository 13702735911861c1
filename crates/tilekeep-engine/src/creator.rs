//! Transforms uncached tile requests into upstream queries

use std::collections::HashSet;
use std::future::Future;

use futures::StreamExt;
use tilekeep_cache::Tile;
use tilekeep_grid::MetaTile;
use tilekeep_image::{merge_images, ImageSource, LayerMerger, MergeLayer, TileSplitter};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::manager::TileManager;
use crate::source::{MapQuery, SourceError};

/// Creates missing tiles by querying the manager's upstream sources.
///
/// Dispatch depends on the configuration: without a meta grid every tile
/// maps to one upstream query; with a meta grid whole blocks of tiles are
/// fetched at once and split. In bulk mode each sub-tile is pulled in
/// parallel from upstream tile caches instead.
pub(crate) struct TileCreator<'a> {
    mgr: &'a TileManager,
}

impl<'a> TileCreator<'a> {
    pub(crate) fn new(mgr: &'a TileManager) -> Self {
        Self { mgr }
    }

    pub(crate) async fn create_tiles(&self, tiles: Vec<Tile>) -> Result<Vec<Tile>> {
        let Some(meta_grid) = self.mgr.meta_grid() else {
            return self
                .fan_out(tiles, |tile| self.create_single_tile(tile))
                .await;
        };

        if self.mgr.minimize_meta_requests() && tiles.len() > 1 {
            let coords: Vec<_> = tiles.iter().filter_map(|t| t.coord).collect();
            let meta = meta_grid.minimal_meta_tile(&coords)?;
            return self.create_meta_tile(meta).await;
        }

        // one request per distinct meta tile
        let mut seen = HashSet::new();
        let mut metas = Vec::new();
        for tile in &tiles {
            let coord = tile.coord.expect("creator only receives real coords");
            if seen.insert(meta_grid.main_tile(coord)) {
                metas.push(meta_grid.meta_tile(coord)?);
            }
        }

        if self.mgr.bulk_meta_tiles() {
            self.fan_out(metas, |meta| self.create_bulk_meta_tile(meta))
                .await
        } else {
            self.fan_out(metas, |meta| self.create_meta_tile(meta)).await
        }
    }

    /// Run one creation job per item on up to `concurrent_tile_creators`
    /// workers, collecting results in arrival order.
    async fn fan_out<T, Fut>(
        &self,
        items: Vec<T>,
        job: impl FnMut(T) -> Fut,
    ) -> Result<Vec<Tile>>
    where
        Fut: Future<Output = Result<Vec<Tile>>>,
    {
        let concurrency = if items.len() > 1 {
            self.mgr.concurrent_tile_creators().max(1)
        } else {
            1
        };
        let mut results = futures::stream::iter(items.into_iter().map(job))
            .buffer_unordered(concurrency);
        let mut created = Vec::new();
        while let Some(result) = results.next().await {
            created.extend(result?);
        }
        Ok(created)
    }

    async fn create_single_tile(&self, mut tile: Tile) -> Result<Vec<Tile>> {
        let coord = tile.coord.expect("creator only receives real coords");
        let grid = self.mgr.grid();
        let query = MapQuery {
            bbox: grid.tile_bbox(coord)?,
            size: grid.tile_size(),
            srs: grid.srs(),
            format: self.mgr.request_format(),
        };

        let _lock = self.mgr.lock(coord).await?;
        if !self.mgr.is_cached_tile(&tile).await? {
            let Some(img) = self.query_sources(&query).await? else {
                return Ok(Vec::new());
            };
            tile.source = Some(img);
            tile = self.mgr.apply_tile_filters(tile)?;
            self.store(&mut tile).await;
        } else {
            // someone else produced the tile while we waited on the lock
            self.mgr.cache().load_tile(&mut tile, false).await?;
        }
        Ok(vec![tile])
    }

    async fn create_meta_tile(&self, meta: MetaTile) -> Result<Vec<Tile>> {
        let grid = self.mgr.grid();
        let query = MapQuery {
            bbox: meta.bbox,
            size: meta.size,
            srs: grid.srs(),
            format: self.mgr.request_format(),
        };

        let _lock = self.mgr.lock(meta.main_coord).await?;
        let mut all_cached = true;
        for coord in meta.tile_coords() {
            if !self.mgr.is_cached(coord).await? {
                all_cached = false;
                break;
            }
        }

        if all_cached {
            // the whole block appeared while we waited on the lock
            let mut tiles = Vec::new();
            for coord in meta.tile_coords() {
                let mut tile = Tile::new(coord);
                self.mgr.cache().load_tile(&mut tile, false).await?;
                tiles.push(tile);
            }
            return Ok(tiles);
        }

        let Some(img) = self.query_sources(&query).await? else {
            return Ok(Vec::new());
        };
        debug!(main = %meta.main_coord, tiles = meta.tile_patterns.len(), "splitting meta tile");
        let splitter = TileSplitter::new(&img, self.mgr.format())?;
        let mut created = Vec::with_capacity(meta.tile_patterns.len());
        for (coord, crop) in &meta.tile_patterns {
            let source = splitter.get_tile(*crop, grid.tile_size());
            let mut tile = Tile::with_source(*coord, source);
            tile = self.mgr.apply_tile_filters(tile)?;
            self.store(&mut tile).await;
            created.push(tile);
        }
        Ok(created)
    }

    /// Bulk mode: every sub-tile comes from an upstream tile cache in
    /// parallel; no image splitting.
    async fn create_bulk_meta_tile(&self, meta: MetaTile) -> Result<Vec<Tile>> {
        let _lock = self.mgr.lock(meta.main_coord).await?;

        let mut tiles = Vec::new();
        let mut to_fetch = Vec::new();
        for coord in meta.tile_coords() {
            if self.mgr.is_cached(coord).await? {
                let mut tile = Tile::new(coord);
                self.mgr.cache().load_tile(&mut tile, false).await?;
                tiles.push(tile);
            } else {
                to_fetch.push(coord);
            }
        }

        let concurrency = self.mgr.concurrent_tile_creators().max(1);
        let mut fetched: Vec<Tile> = Vec::new();
        let mut stream = futures::stream::iter(
            to_fetch.into_iter().map(|coord| self.fetch_bulk_tile(coord)),
        )
        .buffer_unordered(concurrency);
        while let Some(result) = stream.next().await {
            fetched.push(result?);
        }

        if tiles.iter().chain(&fetched).all(|t| t.source.is_none()) {
            return Ok(Vec::new());
        }
        for mut tile in fetched {
            if tile.source.is_some() {
                tile = self.mgr.apply_tile_filters(tile)?;
                self.store(&mut tile).await;
            }
            tiles.push(tile);
        }
        Ok(tiles)
    }

    async fn fetch_bulk_tile(&self, coord: tilekeep_grid::TileCoord) -> Result<Tile> {
        let mut images = Vec::new();
        for source in self.mgr.sources() {
            let access = source
                .tile_access()
                .expect("bulk mode is validated at construction");
            match access.get_tile(coord).await {
                Ok(Some(img)) => images.push(img),
                Ok(None) | Err(SourceError::Blank) => {}
                Err(SourceError::Other(msg)) => return Err(EngineError::Source(msg)),
            }
        }
        let mut tile = Tile::new(coord);
        tile.source = match images.len() {
            0 => None,
            1 => images.pop(),
            _ => Some(merge_images(
                &images,
                self.mgr.image_opts(),
                Some(self.mgr.grid().tile_size()),
            )?),
        };
        Ok(tile)
    }

    /// Query all sources; multiple results merge bottom-first, either by
    /// alpha compositing or through the configured band merger.
    /// Returns `None` when no source contributes anything.
    async fn query_sources(&self, query: &MapQuery) -> Result<Option<ImageSource>> {
        let sources = self.mgr.sources();
        if sources.len() == 1 && self.mgr.band_merger().is_none() {
            return match sources[0].get_map(query).await {
                Ok(img) => Ok(Some(img)),
                Err(SourceError::Blank) => Ok(None),
                Err(SourceError::Other(msg)) => Err(EngineError::Source(msg)),
            };
        }

        let results =
            futures::future::join_all(sources.iter().map(|s| s.get_map(query))).await;
        let mut images = Vec::new();
        let mut opacities = Vec::new();
        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok(img) => {
                    images.push(img);
                    opacities.push(source.opacity());
                }
                Err(SourceError::Blank) => {}
                Err(SourceError::Other(msg)) => return Err(EngineError::Source(msg)),
            }
        }
        if images.is_empty() {
            return Ok(None);
        }

        if let Some(merger) = self.mgr.band_merger() {
            // band selection needs every referenced source image
            if images.len() < merger.required_sources() {
                return Ok(None);
            }
            return Ok(Some(merger.merge(
                &images,
                self.mgr.image_opts(),
                Some(query.size),
            )?));
        }

        let mut layer_merger = LayerMerger::new();
        for (img, opacity) in images.into_iter().zip(opacities) {
            layer_merger.add_layer(MergeLayer {
                source: img,
                opacity,
                coverage: None,
            });
        }
        Ok(Some(layer_merger.merge(
            self.mgr.image_opts(),
            Some(query.size),
            None,
        )?))
    }

    /// Store one created tile; failures are reported, not propagated, so
    /// a broken backend does not abort the whole batch.
    async fn store(&self, tile: &mut Tile) {
        if !tile.cacheable {
            return;
        }
        match self.mgr.cache().store_tile(tile).await {
            Ok(true) => {}
            Ok(false) => warn!(coord = ?tile.coord, "backend busy, tile not stored"),
            Err(err) => warn!(coord = ?tile.coord, %err, "could not store tile"),
        }
    }
}
