//! Compact bundle backends: fixed 128x128 tile blocks per file with a
//! binary index, append-only data region and in-place index updates.
//!
//! Two on-disk versions share the addressing scheme: v1 keeps the index in
//! a separate `.bundlx` file, v2 embeds it in the bundle header. Readers
//! are lock-free; writers serialize on a per-bundle lock file.

mod defrag;
mod v1;
mod v2;

pub use defrag::{defrag_compact_cache, DefragReport};
pub use v1::BundleV1;
pub use v2::BundleV2;

use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tilekeep_grid::TileCoord;
use tilekeep_image::{ImageSource, TileFormat};
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::lock::FileLock;
use crate::store::{already_available, TileStore};
use crate::tile::Tile;

/// Tiles per bundle in each direction
pub const BUNDLE_GRID_WIDTH: u32 = 128;
pub const BUNDLE_GRID_HEIGHT: u32 = 128;

/// One storage file holding a 128x128 block of tiles.
///
/// All methods are blocking; the cache wrappers run them on the blocking
/// thread pool. Writers must hold the bundle's lock file.
pub trait Bundle: Send + Sized + 'static {
    /// Open (not create) the bundle at `base` (path without extension)
    /// covering the block starting at grid offset `offset`.
    fn open(base: PathBuf, offset: (u32, u32)) -> Self;

    /// Lock file serializing writers of this bundle
    fn lock_path(&self) -> PathBuf;

    /// Storage files of the bundle, existing or not
    fn file_paths(&self) -> Vec<PathBuf>;

    /// True if a tile is present at the block-relative position
    fn is_cached(&self, xy: (u32, u32)) -> CacheResult<bool>;

    /// Payload of the tile at the block-relative position
    fn load_tile(&self, xy: (u32, u32)) -> CacheResult<Option<Bytes>>;

    /// Append a tile payload and patch the index
    fn store_tile(&self, xy: (u32, u32), data: &[u8]) -> CacheResult<()>;

    /// Mark the tile as absent; data bytes stay in place
    fn remove_tile(&self, xy: (u32, u32)) -> CacheResult<()>;

    /// `(used_bytes, file_size)` of the bundle data file
    fn size(&self) -> CacheResult<(u64, u64)>;
}

/// Tile cache storing tiles in compact bundle files below `cache_dir`.
///
/// Bundles live in per-level directories (`L<zz>`) and are named by the
/// upper-left grid position of their block (`R<rrrr>C<cccc>`).
pub struct CompactCache<B> {
    cache_dir: PathBuf,
    lock_cache_id: String,
    _bundle: PhantomData<fn() -> B>,
}

/// Compact cache with separate `.bundlx` index files (ArcGIS 10.0)
pub type CompactCacheV1 = CompactCache<BundleV1>;

/// Compact cache with the index embedded in the bundle (ArcGIS 10.3)
pub type CompactCacheV2 = CompactCache<BundleV2>;

impl<B: Bundle> CompactCache<B> {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        let lock_cache_id = format!(
            "compactcache-{:x}",
            md5::compute(cache_dir.to_string_lossy().as_bytes())
        );
        Self {
            cache_dir,
            lock_cache_id,
            _bundle: PhantomData,
        }
    }

    /// Root directory of the cache
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory of all bundles of `level`
    pub fn level_dir(&self, level: u8) -> PathBuf {
        self.cache_dir.join(format!("L{level:02}"))
    }

    /// Bundle base path, block offset and block-relative position of `coord`
    fn locate(&self, coord: TileCoord) -> (PathBuf, (u32, u32), (u32, u32)) {
        let c = coord.x / BUNDLE_GRID_WIDTH * BUNDLE_GRID_WIDTH;
        let r = coord.y / BUNDLE_GRID_HEIGHT * BUNDLE_GRID_HEIGHT;
        let base = self
            .level_dir(coord.z)
            .join(format!("R{r:04x}C{c:04x}"));
        (
            base,
            (c, r),
            (coord.x % BUNDLE_GRID_WIDTH, coord.y % BUNDLE_GRID_HEIGHT),
        )
    }

    fn require_coord(tile: &Tile) -> TileCoord {
        tile.coord.expect("sentinel tiles are handled by the caller")
    }
}

#[async_trait]
impl<B: Bundle> TileStore for CompactCache<B> {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    fn supports_timestamp(&self) -> bool {
        false
    }

    async fn is_cached(&self, tile: &Tile) -> CacheResult<bool> {
        if already_available(tile) {
            return Ok(true);
        }
        let (base, offset, rel) = self.locate(Self::require_coord(tile));
        tokio::task::spawn_blocking(move || B::open(base, offset).is_cached(rel)).await?
    }

    async fn load_tile(&self, tile: &mut Tile, _with_metadata: bool) -> CacheResult<bool> {
        if already_available(tile) {
            return Ok(true);
        }
        let (base, offset, rel) = self.locate(Self::require_coord(tile));
        let data = tokio::task::spawn_blocking(move || B::open(base, offset).load_tile(rel)).await??;
        match data {
            Some(data) => {
                tile.size = Some(data.len() as u64);
                let format = TileFormat::from_magic(&data).unwrap_or(TileFormat::Png);
                tile.source = Some(ImageSource::from_bytes(data, format));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn store_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        if tile.stored {
            return Ok(true);
        }
        // encode outside of the bundle lock
        let data = tile.encode_for_store(None)?;
        let (base, offset, rel) = self.locate(Self::require_coord(tile));

        let bundle = B::open(base, offset);
        let _lock = FileLock::new(bundle.lock_path()).lock().await?;
        debug!(coord = ?tile.coord, bytes = data.len(), "storing tile into bundle");
        tokio::task::spawn_blocking(move || bundle.store_tile(rel, &data)).await??;
        tile.stored = true;
        Ok(true)
    }

    async fn remove_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        if tile.coord.is_none() {
            return Ok(true);
        }
        let (base, offset, rel) = self.locate(Self::require_coord(tile));
        let bundle = B::open(base, offset);
        let _lock = FileLock::new(bundle.lock_path()).lock().await?;
        tokio::task::spawn_blocking(move || bundle.remove_tile(rel)).await??;
        Ok(true)
    }

    async fn load_tile_metadata(&self, tile: &mut Tile) -> CacheResult<()> {
        // bundles do not record timestamps; loading fills the size
        self.load_tile(tile, false).await?;
        Ok(())
    }

    async fn remove_level_tiles_before(
        &self,
        level: u8,
        timestamp: Option<f64>,
    ) -> CacheResult<bool> {
        if timestamp.is_some() {
            return Ok(false);
        }
        match tokio::fs::remove_dir_all(self.level_dir(level)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}

pub(crate) use crate::fs::path_with_suffix;

/// Positioned read; one syscall on Unix
pub(crate) fn pread(file: &mut File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Read, Seek, SeekFrom};
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

/// Positioned write; a single `pwrite` on Unix, so index words are never
/// observed torn by lock-free readers
pub(crate) fn pwrite(file: &mut File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

/// Map missing files to `Ok(None)`, keep other errors
pub(crate) fn open_optional(path: &Path) -> CacheResult<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Corruption error helper
pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> CacheError {
    CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
