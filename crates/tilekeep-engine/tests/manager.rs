//! End-to-end tests of the tile manager pipeline

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use tempfile::TempDir;
use tilekeep_cache::{
    now_timestamp, CompactCacheV2, FileCache, Tile, TileLocker, TileStore,
};
use tilekeep_engine::{
    EngineError, ExpirePolicy, MapQuery, MapSource, SourceError, TileAccess, TileManager,
};
use tilekeep_grid::{BBox, Coverage, Srs, TileCoord, TileGrid};
use tilekeep_image::{ImageSource, TileFormat};

const RED: [u8; 4] = [255, 0, 0, 255];

/// Upstream source producing solid-color images, recording every query
struct SolidSource {
    color: [u8; 4],
    delay: Duration,
    requests: AtomicUsize,
    queries: Mutex<Vec<MapQuery>>,
    blank: bool,
}

impl SolidSource {
    fn new(color: [u8; 4]) -> Self {
        Self {
            color,
            delay: Duration::ZERO,
            requests: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            blank: false,
        }
    }

    fn blank() -> Self {
        Self {
            blank: true,
            ..Self::new([0, 0, 0, 0])
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MapSource for SolidSource {
    async fn get_map(&self, query: &MapQuery) -> Result<ImageSource, SourceError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.blank {
            return Err(SourceError::Blank);
        }
        let img = RgbaImage::from_pixel(query.size.0, query.size.1, Rgba(self.color));
        Ok(ImageSource::from_image(
            DynamicImage::ImageRgba8(img),
            query.format,
        ))
    }
}

fn solid_image(color: [u8; 4]) -> ImageSource {
    let img = RgbaImage::from_pixel(256, 256, Rgba(color));
    ImageSource::from_image(DynamicImage::ImageRgba8(img), TileFormat::Png)
}

fn tile_color(tile: &Tile) -> Rgba<u8> {
    let img = tile
        .source
        .as_ref()
        .expect("tile has a payload")
        .as_image()
        .unwrap();
    *img.to_rgba8().get_pixel(128, 128)
}

struct Harness {
    _dir: TempDir,
    grid: Arc<TileGrid>,
    cache: Arc<FileCache>,
    locker: Arc<TileLocker>,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(FileCache::new(dir.path().join("cache"), TileFormat::Png));
    let locker = Arc::new(
        TileLocker::new(dir.path().join("locks"), cache.lock_cache_id())
            .with_timeout(Duration::from_secs(5)),
    );
    Harness {
        _dir: dir,
        grid: Arc::new(TileGrid::web_mercator(20)),
        cache,
        locker,
    }
}

#[tokio::test]
async fn test_single_tile_cold_cache() {
    let h = harness();
    let source = Arc::new(SolidSource::new(RED));
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .build()
        .unwrap();

    let coord = TileCoord::new(3, 4, 2);
    let tiles = mgr.load_tile_coords(&[coord], false).await.unwrap();
    assert_eq!(tiles.len(), 1);
    assert_eq!(source.request_count(), 1);
    assert_eq!(tile_color(tiles.get(0).unwrap()), Rgba(RED));

    // the created tile was stored
    assert!(h.cache.is_cached(&Tile::new(coord)).await.unwrap());

    // a second request is served from the cache
    let tiles = mgr.load_tile_coords(&[coord], false).await.unwrap();
    assert_eq!(source.request_count(), 1);
    assert_eq!(tile_color(tiles.get(0).unwrap()), Rgba(RED));
}

#[tokio::test]
async fn test_meta_tile_split() {
    let h = harness();
    let source = Arc::new(SolidSource::new(RED));
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .meta_size((2, 2))
        .build()
        .unwrap();

    let coords = [
        TileCoord::new(0, 0, 1),
        TileCoord::new(1, 0, 1),
        TileCoord::new(0, 1, 1),
        TileCoord::new(1, 1, 1),
    ];
    let tiles = mgr.load_tile_coords(&coords, false).await.unwrap();

    // one combined upstream query for the whole block
    assert_eq!(source.request_count(), 1);
    let query = source.queries.lock().unwrap()[0].clone();
    assert_eq!(query.size, (512, 512));

    for coord in coords {
        let tile = tiles.get_by_coord(coord).unwrap();
        assert_eq!(tile_color(tile), Rgba(RED));
        assert!(h.cache.is_cached(&Tile::new(coord)).await.unwrap());
    }
}

#[tokio::test]
async fn test_blank_source_leaves_tiles_empty() {
    let h = harness();
    let source = Arc::new(SolidSource::blank());
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .build()
        .unwrap();

    let tiles = mgr
        .load_tile_coords(&[TileCoord::new(0, 0, 1)], false)
        .await
        .unwrap();
    assert!(tiles.get(0).unwrap().source.is_none());
    assert_eq!(source.request_count(), 1);
    // blanks are not stored
    assert!(!h
        .cache
        .is_cached(&Tile::new(TileCoord::new(0, 0, 1)))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_multiple_sources_merge_bottom_first() {
    let h = harness();
    let bottom = Arc::new(SolidSource::new(RED));
    let top = Arc::new(SolidSource::new([0, 255, 0, 255]));
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(bottom.clone()).source(top.clone())
        .locker(h.locker.clone())
        .build()
        .unwrap();

    let tiles = mgr
        .load_tile_coords(&[TileCoord::new(0, 0, 1)], false)
        .await
        .unwrap();
    // the opaque top layer wins
    assert_eq!(tile_color(tiles.get(0).unwrap()), Rgba([0, 255, 0, 255]));
    assert_eq!(bottom.request_count(), 1);
    assert_eq!(top.request_count(), 1);
}

#[tokio::test]
async fn test_upscale_on_miss() {
    let h = harness();
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .locker(h.locker.clone())
        .upscale_tiles(2)
        .cache_rescaled_tiles(true)
        .build()
        .unwrap();

    // only the grandparent tile is cached
    let mut seed = Tile::with_source(TileCoord::new(2, 2, 6), solid_image(RED));
    h.cache.store_tile(&mut seed).await.unwrap();

    let coord = TileCoord::new(10, 10, 8);
    let tiles = mgr.load_tile_coords(&[coord], false).await.unwrap();
    let tile = tiles.get(0).unwrap();
    assert_eq!(tile_color(tile), Rgba(RED));

    // the rescaled tile was persisted
    assert!(h.cache.is_cached(&Tile::new(coord)).await.unwrap());
}

#[tokio::test]
async fn test_upscale_gives_up_at_stop_zoom() {
    let h = harness();
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .locker(h.locker.clone())
        .upscale_tiles(1)
        .build()
        .unwrap();

    // nothing cached at all: one level of upscaling finds nothing
    let tiles = mgr
        .load_tile_coords(&[TileCoord::new(10, 10, 8)], false)
        .await
        .unwrap();
    assert!(tiles.get(0).unwrap().source.is_none());
}

#[tokio::test]
async fn test_coverage_clipping() {
    let dir = TempDir::new().unwrap();
    let grid = Arc::new(TileGrid::web_mercator(20));

    // the coverage spans the eastern half of tile (1, 0, 1)
    let extent = grid.bbox().maxx;
    let coverage = Coverage::from_bbox(
        BBox::new(extent / 2.0, -extent, extent, 0.0),
        Srs::WEB_MERCATOR,
    )
    .with_clip(true);
    let cache = Arc::new(
        FileCache::new(dir.path().join("cache"), TileFormat::Png).with_coverage(coverage),
    );
    let locker = Arc::new(TileLocker::new(dir.path().join("locks"), cache.lock_cache_id()));

    let source = Arc::new(SolidSource::new(RED));
    let mgr = TileManager::builder(grid, cache, TileFormat::Png)
        .source(source.clone())
        .locker(locker)
        .build()
        .unwrap();

    let tiles = mgr
        .load_tile_coords(&[TileCoord::new(0, 0, 1), TileCoord::new(1, 0, 1)], false)
        .await
        .unwrap();

    // fully outside the coverage: no payload, no upstream request for it
    assert!(tiles.get(0).unwrap().source.is_none());

    // partially covered: west half transparent, east half intact
    let img = tiles
        .get(1)
        .unwrap()
        .source
        .as_ref()
        .unwrap()
        .as_image()
        .unwrap()
        .to_rgba8();
    assert_eq!(img.get_pixel(64, 128).0[3], 0);
    assert_eq!(img.get_pixel(192, 128), &Rgba(RED));
}

#[tokio::test]
async fn test_concurrent_requests_fetch_once() {
    let h = harness();
    let source = Arc::new(SolidSource::new(RED).with_delay(Duration::from_millis(100)));
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .build()
        .unwrap();

    let coord = TileCoord::new(0, 0, 0);
    let started = Instant::now();
    let (a, b) = tokio::join!(
        mgr.load_tile_coord(coord, false),
        mgr.load_tile_coord(coord, false),
    );
    let elapsed = started.elapsed();

    // exactly one upstream query; the second caller reads from the cache
    assert_eq!(source.request_count(), 1);
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(tile_color(&a), Rgba(RED));
    assert_eq!(tile_color(&b), Rgba(RED));
    assert!(
        elapsed < Duration::from_millis(2000),
        "requests were serialized into upstream fetches: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_expiry_refetches_stale_tiles() {
    let h = harness();
    let source = Arc::new(SolidSource::new(RED));

    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .build()
        .unwrap();
    let coord = TileCoord::new(1, 1, 2);
    mgr.load_tile_coord(coord, false).await.unwrap();
    assert_eq!(source.request_count(), 1);

    // a manager that expires everything stored until now
    let stale_mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .expire_policy(ExpirePolicy::Timestamp(now_timestamp() + 1.0))
        .build()
        .unwrap();

    assert!(stale_mgr.is_stale(coord).await.unwrap());
    assert!(!stale_mgr.is_cached(coord).await.unwrap());

    stale_mgr.load_tile_coord(coord, false).await.unwrap();
    assert_eq!(source.request_count(), 2);
}

#[tokio::test]
async fn test_remove_tile_coords() {
    let h = harness();
    let source = Arc::new(SolidSource::new(RED));
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .build()
        .unwrap();

    let coord = TileCoord::new(2, 3, 3);
    mgr.load_tile_coord(coord, false).await.unwrap();
    assert!(mgr.is_cached(coord).await.unwrap());

    mgr.remove_tile_coords(&[coord]).await.unwrap();
    assert!(!mgr.is_cached(coord).await.unwrap());
}

#[tokio::test]
async fn test_session_cleanup() {
    let h = harness();
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .locker(h.locker.clone())
        .build()
        .unwrap();

    let session = mgr.session();
    session
        .load_tile_coords(&[TileCoord::new(0, 0, 1)], false)
        .await
        .unwrap();
    session.finish().await;
}

#[tokio::test]
async fn test_disable_storage_always_fetches() {
    let h = harness();
    let source = Arc::new(SolidSource::new(RED));
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .disable_storage(true)
        .build()
        .unwrap();

    let coord = TileCoord::new(0, 0, 1);
    mgr.load_tile_coord(coord, false).await.unwrap();
    mgr.load_tile_coord(coord, false).await.unwrap();
    assert_eq!(source.request_count(), 2);
    assert!(!h.cache.is_cached(&Tile::new(coord)).await.unwrap());
}

#[tokio::test]
async fn test_invalid_configurations_rejected() {
    let h = harness();

    let err = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .upscale_tiles(1)
        .downscale_tiles(1)
        .build()
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));

    // compact bundles record no timestamps, so expiry cannot work
    let dir = TempDir::new().unwrap();
    let compact = Arc::new(CompactCacheV2::new(dir.path()));
    let err = TileManager::builder(h.grid.clone(), compact, TileFormat::Png)
        .expire_policy(ExpirePolicy::RefreshBeforeSeconds(60.0))
        .build()
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
}

/// Source that is itself a tile cache, for bulk meta-tile mode
struct TiledUpstream {
    color: [u8; 4],
    tile_requests: AtomicUsize,
}

#[async_trait]
impl MapSource for TiledUpstream {
    async fn get_map(&self, _query: &MapQuery) -> Result<ImageSource, SourceError> {
        Err(SourceError::Other("tiled source queried as map".to_string()))
    }

    fn supports_meta_tiles(&self) -> bool {
        false
    }

    fn tile_access(&self) -> Option<&dyn TileAccess> {
        Some(self)
    }
}

#[async_trait]
impl TileAccess for TiledUpstream {
    async fn get_tile(&self, _coord: TileCoord) -> Result<Option<ImageSource>, SourceError> {
        self.tile_requests.fetch_add(1, Ordering::SeqCst);
        Ok(Some(solid_image(self.color)))
    }
}

#[tokio::test]
async fn test_bulk_meta_tiles() {
    let h = harness();
    let upstream = Arc::new(TiledUpstream {
        color: RED,
        tile_requests: AtomicUsize::new(0),
    });
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(upstream.clone())
        .locker(h.locker.clone())
        .meta_size((2, 2))
        .bulk_meta_tiles(true)
        .concurrent_tile_creators(4)
        .build()
        .unwrap();

    let coords = [
        TileCoord::new(0, 0, 1),
        TileCoord::new(1, 0, 1),
        TileCoord::new(0, 1, 1),
        TileCoord::new(1, 1, 1),
    ];
    let tiles = mgr.load_tile_coords(&coords, false).await.unwrap();

    // every sub-tile was fetched individually, no map request happened
    assert_eq!(upstream.tile_requests.load(Ordering::SeqCst), 4);
    for coord in coords {
        assert_eq!(tile_color(tiles.get_by_coord(coord).unwrap()), Rgba(RED));
        assert!(h.cache.is_cached(&Tile::new(coord)).await.unwrap());
    }
}

#[tokio::test]
async fn test_band_merger_composes_sources() {
    use tilekeep_image::{BandMerger, ColorMode};

    let h = harness();
    let infrared = Arc::new(SolidSource::new([200, 10, 10, 255]));
    let optical = Arc::new(SolidSource::new([10, 20, 30, 255]));

    // red band from the first source, green/blue from the second
    let mut merger = BandMerger::new(ColorMode::Rgb);
    merger.add_op(0, 0, 0, 1.0).unwrap();
    merger.add_op(1, 1, 1, 1.0).unwrap();
    merger.add_op(2, 1, 2, 1.0).unwrap();

    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(infrared.clone())
        .source(optical.clone())
        .locker(h.locker.clone())
        .band_merger(merger)
        .build()
        .unwrap();

    let tiles = mgr
        .load_tile_coords(&[TileCoord::new(0, 0, 1)], false)
        .await
        .unwrap();
    assert_eq!(tile_color(tiles.get(0).unwrap()), Rgba([200, 20, 30, 255]));
}

#[tokio::test]
async fn test_minimize_meta_requests() {
    let h = harness();
    let source = Arc::new(SolidSource::new(RED));
    let mgr = TileManager::builder(h.grid.clone(), h.cache.clone(), TileFormat::Png)
        .source(source.clone())
        .locker(h.locker.clone())
        .meta_size((4, 4))
        .minimize_meta_requests(true)
        .build()
        .unwrap();

    // two adjacent tiles: one minimal request covering exactly both
    let coords = [TileCoord::new(5, 3, 4), TileCoord::new(6, 3, 4)];
    let tiles = mgr.load_tile_coords(&coords, false).await.unwrap();
    assert_eq!(source.request_count(), 1);
    let query = source.queries.lock().unwrap()[0].clone();
    assert_eq!(query.size, (512, 256));
    for coord in coords {
        assert_eq!(tile_color(tiles.get_by_coord(coord).unwrap()), Rgba(RED));
    }
}
