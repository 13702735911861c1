//! Hierarchical file-system backend with single-color deduplication

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tilekeep_grid::Coverage;
use tilekeep_image::{single_color, ImageSource, TileFormat};
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::fs::{ensure_directory, parse_permissions, write_atomic};
use crate::path::{dimensions_part, DirectoryLayout};
use crate::store::{already_available, TileStore};
use crate::tile::Tile;

/// How single-color tiles are linked to their canonical file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Symlink,
    Hardlink,
}

/// Stores each tile as one file below `cache_dir`.
///
/// The directory layout is configurable; tiles that consist of a single
/// color can optionally be stored once under `single_color_tiles/` and
/// linked from their coordinate paths.
pub struct FileCache {
    cache_dir: PathBuf,
    format: TileFormat,
    layout: DirectoryLayout,
    link_single_color: Option<LinkMode>,
    dimensions: Option<BTreeMap<String, String>>,
    coverage: Option<Coverage>,
    directory_permissions: Option<u32>,
    file_permissions: Option<u32>,
    lock_cache_id: String,
}

impl FileCache {
    /// New cache below `cache_dir` storing tiles in `format`
    pub fn new(cache_dir: impl Into<PathBuf>, format: TileFormat) -> Self {
        let cache_dir = cache_dir.into();
        let lock_cache_id = format!("file-{:x}", md5::compute(cache_dir.to_string_lossy().as_bytes()));
        Self {
            cache_dir,
            format,
            layout: DirectoryLayout::Tc,
            link_single_color: None,
            dimensions: None,
            coverage: None,
            directory_permissions: None,
            file_permissions: None,
            lock_cache_id,
        }
    }

    /// Use a different directory layout
    pub fn with_layout(mut self, layout: DirectoryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Deduplicate single-color tiles via links.
    /// Not supported on platforms without symlinks.
    pub fn with_link_single_color(mut self, mode: LinkMode) -> Self {
        if cfg!(windows) {
            tracing::warn!("link_single_color_images not supported on windows");
            return self;
        }
        self.link_single_color = Some(mode);
        self
    }

    /// Store tiles under a dimension sub-path (e.g. time, elevation)
    pub fn with_dimensions(mut self, dimensions: BTreeMap<String, String>) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Restrict the cache to a coverage
    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Octal permission strings for created directories and tile files
    pub fn with_permissions(
        mut self,
        directory_permissions: Option<&str>,
        file_permissions: Option<&str>,
    ) -> CacheResult<Self> {
        if let Some(p) = directory_permissions {
            self.directory_permissions = Some(
                parse_permissions(p)
                    .ok_or_else(|| CacheError::Configuration(format!("invalid mode {p:?}")))?,
            );
        }
        if let Some(p) = file_permissions {
            self.file_permissions = Some(
                parse_permissions(p)
                    .ok_or_else(|| CacheError::Configuration(format!("invalid mode {p:?}")))?,
            );
        }
        Ok(self)
    }

    fn base_dir(&self) -> PathBuf {
        match &self.dimensions {
            Some(dims) if !dims.is_empty() => self.cache_dir.join(dimensions_part(dims)),
            _ => self.cache_dir.clone(),
        }
    }

    /// Absolute path of `tile`, memoized on the tile
    pub fn tile_location(&self, tile: &mut Tile) -> PathBuf {
        let coord = tile.coord.expect("tile location requires a coordinate");
        let base = self.base_dir();
        let layout = self.layout;
        let ext = self.format.ext();
        tile.location_or_insert(|| base.join(layout.tile_path(coord, ext)))
    }

    /// Directory holding all tiles of `level`
    pub fn level_location(&self, level: u8) -> Option<PathBuf> {
        self.layout
            .level_path(level)
            .map(|p| self.base_dir().join(p))
    }

    /// Canonical path for a single-color tile
    fn single_color_location(&self, hex: &str) -> PathBuf {
        self.cache_dir
            .join("single_color_tiles")
            .join(format!("{hex}.{}", self.format.ext()))
    }

    fn update_metadata(&self, tile: &mut Tile) -> CacheResult<bool> {
        let location = self.tile_location(tile);
        match std::fs::symlink_metadata(&location) {
            Ok(meta) => {
                tile.size = Some(meta.len());
                tile.timestamp = Some(
                    meta.modified()?
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(0.0),
                );
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tile.size = Some(0);
                tile.timestamp = Some(0.0);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn store_data(&self, location: &Path, data: &[u8]) -> CacheResult<()> {
        ensure_directory(location, self.directory_permissions)?;
        // replace links instead of writing through them
        if location.is_symlink() {
            std::fs::remove_file(location)?;
        }
        write_atomic(location, data, self.file_permissions)?;
        Ok(())
    }

    fn link_tile(&self, location: &Path, canonical: &Path, mode: LinkMode) -> CacheResult<()> {
        if location.exists() || location.is_symlink() {
            std::fs::remove_file(location)?;
        }
        ensure_directory(location, self.directory_permissions)?;
        debug!(from = %canonical.display(), to = %location.display(), "linking single color tile");
        match mode {
            #[cfg(unix)]
            LinkMode::Symlink => std::os::unix::fs::symlink(canonical, location)?,
            #[cfg(not(unix))]
            LinkMode::Symlink => std::fs::hard_link(canonical, location)?,
            LinkMode::Hardlink => std::fs::hard_link(canonical, location)?,
        }
        Ok(())
    }
}

#[async_trait]
impl TileStore for FileCache {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    fn coverage(&self) -> Option<&Coverage> {
        self.coverage.as_ref()
    }

    async fn is_cached(&self, tile: &Tile) -> CacheResult<bool> {
        if already_available(tile) {
            return Ok(true);
        }
        let mut tile = tile.clone();
        Ok(self.tile_location(&mut tile).exists())
    }

    async fn load_tile(&self, tile: &mut Tile, with_metadata: bool) -> CacheResult<bool> {
        if already_available(tile) {
            return Ok(true);
        }
        let location = self.tile_location(tile);
        match tokio::fs::read(&location).await {
            Ok(data) => {
                if with_metadata {
                    self.update_metadata(tile)?;
                }
                tile.source = Some(ImageSource::from_bytes(data, self.format));
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn store_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        if tile.stored {
            return Ok(true);
        }
        let data = tile.encode_for_store(Some(self.format))?;
        let location = self.tile_location(tile);

        if let Some(mode) = self.link_single_color {
            let img = tile
                .source
                .as_ref()
                .expect("payload checked by encode_for_store")
                .as_image()?;
            if let Some(color) = single_color(&img) {
                let canonical = self.single_color_location(&color.hex());
                if !canonical.exists() {
                    ensure_directory(&canonical, self.directory_permissions)?;
                    write_atomic(&canonical, &data, self.file_permissions)?;
                }
                self.link_tile(&location, &canonical, mode)?;
                tile.stored = true;
                return Ok(true);
            }
        }

        debug!(coord = ?tile.coord, path = %location.display(), "storing tile");
        self.store_data(&location, &data)?;
        tile.stored = true;
        Ok(true)
    }

    async fn remove_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        if tile.coord.is_none() {
            return Ok(true);
        }
        let location = self.tile_location(tile);
        match tokio::fs::remove_file(&location).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_tile_metadata(&self, tile: &mut Tile) -> CacheResult<()> {
        self.update_metadata(tile)?;
        Ok(())
    }

    async fn remove_level_tiles_before(
        &self,
        level: u8,
        timestamp: Option<f64>,
    ) -> CacheResult<bool> {
        let Some(level_dir) = self.level_location(level) else {
            return Ok(false);
        };
        match timestamp {
            None => {
                match tokio::fs::remove_dir_all(&level_dir).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(true)
            }
            Some(timestamp) => {
                remove_files_before(&level_dir, timestamp)?;
                Ok(true)
            }
        }
    }
}

/// Remove regular files under `dir` with an mtime before `timestamp`,
/// pruning directories that become empty.
fn remove_files_before(dir: &Path, timestamp: f64) -> CacheResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_files_before(&path, timestamp)?;
            let _ = std::fs::remove_dir(&path);
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        if mtime < timestamp {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}
