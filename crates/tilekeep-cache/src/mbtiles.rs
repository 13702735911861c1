//! MBTiles backends: one SQLite file per cache or per zoom level

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tilekeep_grid::{Coverage, TileCoord};
use tilekeep_image::{ImageSource, TileFormat};
use tracing::{info, warn};

use crate::error::{CacheError, CacheResult};
use crate::fs::ensure_directory;
use crate::lock::FileLock;
use crate::store::{already_available, TileStore};
use crate::tile::{now_timestamp, Tile};

/// SQLite binds at most this many parameters per statement
const MAX_SQL_PARAMS: usize = 999;

/// Tile cache in a single MBTiles (SQLite) file.
///
/// Timestamps are not part of the MBTiles specification; with
/// `with_timestamps` an extra `last_modified` column (unix seconds) is
/// maintained and TTL-based expiry becomes available.
pub struct MBTilesCache {
    mbtile_file: PathBuf,
    lock_cache_id: String,
    with_timestamps: bool,
    ttl: Option<f64>,
    wal: bool,
    coverage: Option<Coverage>,
    conn: Mutex<Option<Connection>>,
}

impl MBTilesCache {
    /// Open or create the MBTiles file
    pub async fn new(mbtile_file: impl Into<PathBuf>) -> CacheResult<Self> {
        Self::with_options(mbtile_file, false, None, false, None).await
    }

    /// Open or create with timestamp support, TTL (seconds) and WAL mode
    pub async fn with_options(
        mbtile_file: impl Into<PathBuf>,
        with_timestamps: bool,
        ttl: Option<f64>,
        wal: bool,
        coverage: Option<Coverage>,
    ) -> CacheResult<Self> {
        let mbtile_file = mbtile_file.into();
        let lock_cache_id = format!(
            "mbtiles-{:x}",
            md5::compute(mbtile_file.to_string_lossy().as_bytes())
        );
        let cache = Self {
            mbtile_file,
            lock_cache_id,
            with_timestamps,
            ttl: with_timestamps.then_some(ttl).flatten(),
            wal,
            coverage,
            conn: Mutex::new(None),
        };
        cache.ensure_mbtile().await?;
        Ok(cache)
    }

    /// Create the schema once, serialized against other processes
    async fn ensure_mbtile(&self) -> CacheResult<()> {
        if self.mbtile_file.exists() {
            return Ok(());
        }
        let init_lock = FileLock::new(crate::fs::path_with_suffix(
            &self.mbtile_file,
            ".init.lck",
        ));
        let _guard = init_lock.lock().await?;
        if self.mbtile_file.exists() {
            return Ok(());
        }
        info!(path = %self.mbtile_file.display(), "initializing MBTiles file");
        ensure_directory(&self.mbtile_file, None)?;
        let conn = Connection::open(&self.mbtile_file)?;
        if self.wal {
            conn.pragma_update(None, "journal_mode", "wal")?;
        }
        let timestamp_column = if self.with_timestamps {
            ", last_modified real DEFAULT (unixepoch())"
        } else {
            ""
        };
        conn.execute_batch(&format!(
            "CREATE TABLE tiles (
                zoom_level integer,
                tile_column integer,
                tile_row integer,
                tile_data blob{timestamp_column}
            );
            CREATE TABLE metadata (name text, value text);
            CREATE UNIQUE INDEX idx_tile ON tiles (zoom_level, tile_column, tile_row);"
        ))?;
        Ok(())
    }

    /// Run `f` with the cached per-cache connection, opening it on demand
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> CacheResult<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            *guard = Some(Connection::open(&self.mbtile_file)?);
        }
        Ok(f(guard.as_ref().expect("opened above"))?)
    }

    /// Replace the `metadata` table contents
    pub async fn update_metadata(
        &self,
        name: &str,
        description: &str,
        version: &str,
        overlay: bool,
        format: TileFormat,
    ) -> CacheResult<()> {
        let layer_type = if overlay { "overlay" } else { "baselayer" };
        let rows = [
            ("name", name.to_string()),
            ("description", description.to_string()),
            ("version", version.to_string()),
            ("type", layer_type.to_string()),
            ("format", format.ext().to_string()),
        ];
        self.with_conn(|conn| {
            conn.execute("DELETE FROM metadata", [])?;
            let mut stmt = conn.prepare("INSERT INTO metadata (name, value) VALUES (?1, ?2)")?;
            for (name, value) in &rows {
                stmt.execute(params![name, value])?;
            }
            Ok(())
        })
    }

    fn ttl_cutoff(&self) -> Option<f64> {
        self.ttl.map(|ttl| now_timestamp() - ttl)
    }

    fn store_records(&self, records: &[(TileCoord, bytes::Bytes, f64)]) -> CacheResult<bool> {
        let result = self.with_conn(|conn| {
            let mut stmt = if self.with_timestamps {
                conn.prepare(
                    "INSERT OR REPLACE INTO tiles
                     (zoom_level, tile_column, tile_row, tile_data, last_modified)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
            } else {
                conn.prepare(
                    "INSERT OR REPLACE INTO tiles
                     (zoom_level, tile_column, tile_row, tile_data)
                     VALUES (?1, ?2, ?3, ?4)",
                )?
            };
            for (coord, data, timestamp) in records {
                if self.with_timestamps {
                    stmt.execute(params![coord.z, coord.x, coord.y, &data[..], timestamp])?;
                } else {
                    stmt.execute(params![coord.z, coord.x, coord.y, &data[..]])?;
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => Ok(true),
            // a busy database is a soft failure: the tile is not stored
            Err(CacheError::Sqlite(err)) if is_busy(&err) => {
                warn!(%err, "unable to store tile");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn fill_tile(tile: &mut Tile, data: Vec<u8>, timestamp: Option<f64>) {
    tile.size = Some(data.len() as u64);
    tile.timestamp = timestamp;
    let format = TileFormat::from_magic(&data).unwrap_or(TileFormat::Png);
    tile.source = Some(ImageSource::from_bytes(data, format));
}

#[async_trait]
impl TileStore for MBTilesCache {
    fn lock_cache_id(&self) -> &str {
        &self.lock_cache_id
    }

    fn coverage(&self) -> Option<&Coverage> {
        self.coverage.as_ref()
    }

    fn supports_timestamp(&self) -> bool {
        self.with_timestamps
    }

    async fn is_cached(&self, tile: &Tile) -> CacheResult<bool> {
        if already_available(tile) {
            return Ok(true);
        }
        let coord = tile.coord.expect("checked by already_available");
        let cutoff = self.ttl_cutoff();
        self.with_conn(|conn| {
            let mut sql = "SELECT 1 FROM tiles
                 WHERE tile_column = ?1 AND tile_row = ?2 AND zoom_level = ?3"
                .to_string();
            if let Some(cutoff) = cutoff {
                sql.push_str(&format!(" AND last_modified > {cutoff}"));
            }
            conn.query_row(&sql, params![coord.x, coord.y, coord.z], |_| Ok(()))
                .optional()
                .map(|row| row.is_some())
        })
    }

    async fn load_tile(&self, tile: &mut Tile, _with_metadata: bool) -> CacheResult<bool> {
        if already_available(tile) {
            return Ok(true);
        }
        let coord = tile.coord.expect("checked by already_available");
        let cutoff = self.ttl_cutoff();
        let with_timestamps = self.with_timestamps;
        let row = self.with_conn(|conn| {
            let mut sql = if with_timestamps {
                "SELECT tile_data, last_modified FROM tiles
                 WHERE tile_column = ?1 AND tile_row = ?2 AND zoom_level = ?3"
                    .to_string()
            } else {
                "SELECT tile_data FROM tiles
                 WHERE tile_column = ?1 AND tile_row = ?2 AND zoom_level = ?3"
                    .to_string()
            };
            if let Some(cutoff) = cutoff {
                sql.push_str(&format!(" AND last_modified > {cutoff}"));
            }
            conn.query_row(&sql, params![coord.x, coord.y, coord.z], |row| {
                let data: Vec<u8> = row.get(0)?;
                let timestamp: Option<f64> = if with_timestamps { row.get(1)? } else { None };
                Ok((data, timestamp))
            })
            .optional()
        })?;
        match row {
            Some((data, timestamp)) => {
                fill_tile(tile, data, timestamp);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_tiles(&self, tiles: &mut [Tile], _with_metadata: bool) -> CacheResult<bool> {
        let mut pending: HashMap<(u32, u32), usize> = HashMap::new();
        let mut coords = Vec::new();
        for (i, tile) in tiles.iter().enumerate() {
            if already_available(tile) {
                continue;
            }
            let coord = tile.coord.expect("missing tiles have coords");
            pending.insert((coord.x, coord.y), i);
            coords.push(coord);
        }
        if pending.is_empty() {
            return Ok(true);
        }

        let with_timestamps = self.with_timestamps;
        let cutoff = self.ttl_cutoff();
        let mut loaded = 0usize;

        // chunked to stay below SQLite's bind parameter limit
        for chunk in coords.chunks(MAX_SQL_PARAMS / 3) {
            let rows = self.with_conn(|conn| {
                let select = if with_timestamps {
                    "SELECT tile_column, tile_row, tile_data, last_modified FROM tiles WHERE "
                } else {
                    "SELECT tile_column, tile_row, tile_data FROM tiles WHERE "
                };
                let mut sql = select.to_string();
                if let Some(cutoff) = cutoff {
                    sql.push_str(&format!("last_modified > {cutoff} AND "));
                }
                let condition =
                    vec!["(tile_column = ? AND tile_row = ? AND zoom_level = ?)"; chunk.len()]
                        .join(" OR ");
                sql.push_str(&format!("({condition})"));

                let mut stmt = conn.prepare(&sql)?;
                let mut bindings: Vec<u32> = Vec::with_capacity(chunk.len() * 3);
                for coord in chunk {
                    bindings.extend([coord.x, coord.y, coord.z as u32]);
                }
                let mut rows_out = Vec::new();
                let mut rows = stmt.query(rusqlite::params_from_iter(bindings))?;
                while let Some(row) = rows.next()? {
                    let x: u32 = row.get(0)?;
                    let y: u32 = row.get(1)?;
                    let data: Vec<u8> = row.get(2)?;
                    let timestamp: Option<f64> =
                        if with_timestamps { row.get(3)? } else { None };
                    rows_out.push((x, y, data, timestamp));
                }
                Ok(rows_out)
            })?;

            for (x, y, data, timestamp) in rows {
                if let Some(&i) = pending.get(&(x, y)) {
                    fill_tile(&mut tiles[i], data, timestamp);
                    loaded += 1;
                }
            }
        }
        Ok(loaded == pending.len())
    }

    async fn store_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        if tile.stored {
            return Ok(true);
        }
        let data = tile.encode_for_store(None)?;
        let coord = tile.coord.expect("stored tiles have coords");
        let timestamp = tile.timestamp.unwrap_or_else(now_timestamp);
        if self.store_records(&[(coord, data, timestamp)])? {
            tile.stored = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn store_tiles(&self, tiles: &mut [Tile]) -> CacheResult<bool> {
        // encode everything before the write transaction
        let mut records = Vec::new();
        let mut indexes = Vec::new();
        for (i, tile) in tiles.iter_mut().enumerate() {
            if tile.stored {
                continue;
            }
            let data = tile.encode_for_store(None)?;
            let coord = tile.coord.expect("stored tiles have coords");
            records.push((coord, data, tile.timestamp.unwrap_or_else(now_timestamp)));
            indexes.push(i);
        }
        if records.is_empty() {
            return Ok(true);
        }
        if self.store_records(&records)? {
            for i in indexes {
                tiles[i].stored = true;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn remove_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        let Some(coord) = tile.coord else {
            return Ok(true);
        };
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM tiles
                 WHERE tile_column = ?1 AND tile_row = ?2 AND zoom_level = ?3",
                params![coord.x, coord.y, coord.z],
            )
        })?;
        Ok(true)
    }

    async fn load_tile_metadata(&self, tile: &mut Tile) -> CacheResult<()> {
        if self.with_timestamps {
            self.load_tile(tile, true).await?;
        } else {
            // MBTiles without the timestamp extension cannot expire
            tile.timestamp = None;
        }
        Ok(())
    }

    async fn remove_level_tiles_before(
        &self,
        level: u8,
        timestamp: Option<f64>,
    ) -> CacheResult<bool> {
        match timestamp {
            None => {
                self.with_conn(|conn| {
                    conn.execute("DELETE FROM tiles WHERE zoom_level = ?1", params![level])
                })?;
                Ok(true)
            }
            Some(timestamp) if self.with_timestamps => {
                self.with_conn(|conn| {
                    conn.execute(
                        "DELETE FROM tiles WHERE zoom_level = ?1 AND last_modified < ?2",
                        params![level, timestamp],
                    )
                })?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn cleanup(&self) {
        // drop the cached connection; the next access reopens it
        *self.conn.lock() = None;
    }
}

/// One MBTiles file per zoom level below a directory, lazily opened.
/// Level caches always record timestamps.
pub struct MBTilesLevelCache {
    cache_dir: PathBuf,
    lock_cache_id: String,
    ttl: Option<f64>,
    wal: bool,
    coverage: Option<Coverage>,
    levels: tokio::sync::Mutex<HashMap<u8, Arc<MBTilesCache>>>,
}

impl MBTilesLevelCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_options(cache_dir, None, false, None)
    }

    pub fn with_options(
        cache_dir: impl Into<PathBuf>,
        ttl: Option<f64>,
        wal: bool,
        coverage: Option<Coverage>,
    ) -> Self {
        let cache_dir = cache_dir.into();
        let lock_cache_id = format!(
            "sqlite-{:x}",
            md5::compute(cache_dir.to_string_lossy().as_bytes())
        );
        Self {
            cache_dir,
            lock_cache_id,
            ttl,
            wal,
            coverage,
            levels: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn level_file(&self, level: u8) -> PathBuf {
        self.cache_dir.join(format!("{level}.mbtiles"))
    }

    async fn level(&self, level: u8) -> CacheResult<Arc<MBTilesCache>> {
        let mut levels = self.levels.lock().await;
        if let Some(cache) = levels.get(&level) {
            return Ok(cache.clone());
        }
        let cache = Arc::new(
            MBTilesCache::with_options(
                self.level_file(level),
                true,
                self.ttl,
                self.wal,
                self.coverage.clone(),
            )
            .await?,
        );
        levels.insert(level, cache.clone());
        Ok(cache)
    }

    fn level_of(tiles: &[Tile]) -> Option<u8> {
        tiles
            .iter()
            .find(|t| !already_available(t))
            .and_then(|t| t.coord)
            .map(|c| c.z)
    }
}

#[async_trait]
impl TileStore for MBTilesLevelCache {
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
        let level = tile.coord.expect("checked by already_available").z;
        self.level(level).await?.is_cached(tile).await
    }

    async fn load_tile(&self, tile: &mut Tile, with_metadata: bool) -> CacheResult<bool> {
        if already_available(tile) {
            return Ok(true);
        }
        let level = tile.coord.expect("checked by already_available").z;
        self.level(level).await?.load_tile(tile, with_metadata).await
    }

    async fn load_tiles(&self, tiles: &mut [Tile], with_metadata: bool) -> CacheResult<bool> {
        let Some(level) = Self::level_of(tiles) else {
            return Ok(true);
        };
        self.level(level).await?.load_tiles(tiles, with_metadata).await
    }

    async fn store_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        if tile.stored {
            return Ok(true);
        }
        let level = tile.coord.expect("stored tiles have coords").z;
        self.level(level).await?.store_tile(tile).await
    }

    async fn store_tiles(&self, tiles: &mut [Tile]) -> CacheResult<bool> {
        let mut all_stored = true;
        let mut by_level: HashMap<u8, Vec<usize>> = HashMap::new();
        for (i, tile) in tiles.iter().enumerate() {
            if tile.stored {
                continue;
            }
            let level = tile.coord.expect("stored tiles have coords").z;
            by_level.entry(level).or_default().push(i);
        }
        for (level, indexes) in by_level {
            let cache = self.level(level).await?;
            for i in indexes {
                if !cache.store_tile(&mut tiles[i]).await? {
                    all_stored = false;
                }
            }
        }
        Ok(all_stored)
    }

    async fn remove_tile(&self, tile: &mut Tile) -> CacheResult<bool> {
        let Some(coord) = tile.coord else {
            return Ok(true);
        };
        self.level(coord.z).await?.remove_tile(tile).await
    }

    async fn load_tile_metadata(&self, tile: &mut Tile) -> CacheResult<()> {
        if let Some(coord) = tile.coord {
            self.level(coord.z).await?.load_tile_metadata(tile).await?;
        }
        Ok(())
    }

    async fn remove_level_tiles_before(
        &self,
        level: u8,
        timestamp: Option<f64>,
    ) -> CacheResult<bool> {
        match timestamp {
            None => {
                let mut levels = self.levels.lock().await;
                if let Some(cache) = levels.remove(&level) {
                    cache.cleanup().await;
                }
                match tokio::fs::remove_file(self.level_file(level)).await {
                    Ok(()) => Ok(true),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
                    Err(err) => Err(err.into()),
                }
            }
            Some(timestamp) => {
                self.level(level)
                    .await?
                    .remove_level_tiles_before(level, Some(timestamp))
                    .await
            }
        }
    }

    async fn cleanup(&self) {
        let levels = self.levels.lock().await;
        for cache in levels.values() {
            cache.cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn png_tile(coord: TileCoord, fill: u8) -> Tile {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend(std::iter::repeat(fill).take(64));
        Tile::with_source(coord, ImageSource::from_bytes(data, TileFormat::Png))
    }

    #[tokio::test]
    async fn test_store_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = MBTilesCache::new(dir.path().join("tiles.mbtiles"))
            .await
            .unwrap();

        let coord = TileCoord::new(3009, 589, 12);
        assert!(!cache.is_cached(&Tile::new(coord)).await.unwrap());

        let mut tile = png_tile(coord, 1);
        assert!(cache.store_tile(&mut tile).await.unwrap());
        assert!(tile.stored);

        let mut loaded = Tile::new(coord);
        assert!(cache.load_tile(&mut loaded, false).await.unwrap());
        assert_eq!(
            loaded.source.unwrap().as_bytes(None).unwrap(),
            tile.source.unwrap().as_bytes(None).unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_tiles_mixed() {
        let dir = TempDir::new().unwrap();
        let cache = MBTilesCache::new(dir.path().join("tiles.mbtiles"))
            .await
            .unwrap();

        let mut stored = png_tile(TileCoord::new(1, 0, 4), 7);
        cache.store_tile(&mut stored).await.unwrap();

        let mut tiles = vec![
            Tile::new(None),
            Tile::new(TileCoord::new(0, 0, 4)),
            Tile::new(TileCoord::new(1, 0, 4)),
        ];
        assert!(!cache.load_tiles(&mut tiles, false).await.unwrap());
        assert!(!tiles[0].is_missing());
        assert!(tiles[1].is_missing());
        assert!(!tiles[2].is_missing());
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = TempDir::new().unwrap();
        let cache = MBTilesCache::new(dir.path().join("tiles.mbtiles"))
            .await
            .unwrap();
        let coord = TileCoord::new(1, 0, 4);
        let mut tile = png_tile(coord, 2);
        cache.store_tile(&mut tile).await.unwrap();
        assert!(cache.is_cached(&Tile::new(coord)).await.unwrap());

        assert!(cache.remove_tile(&mut Tile::new(coord)).await.unwrap());
        assert!(!cache.is_cached(&Tile::new(coord)).await.unwrap());
        // removing absent tiles succeeds
        assert!(cache.remove_tile(&mut Tile::new(coord)).await.unwrap());
    }

    #[tokio::test]
    async fn test_timestamps() {
        let dir = TempDir::new().unwrap();
        let cache = MBTilesCache::with_options(
            dir.path().join("tiles.mbtiles"),
            true,
            None,
            false,
            None,
        )
        .await
        .unwrap();
        assert!(cache.supports_timestamp());

        let coord = TileCoord::new(0, 0, 1);
        let mut tile = png_tile(coord, 3);
        cache.store_tile(&mut tile).await.unwrap();

        let mut loaded = Tile::new(coord);
        cache.load_tile_metadata(&mut loaded).await.unwrap();
        let age = now_timestamp() - loaded.timestamp.unwrap();
        assert!(age < 10.0, "timestamp too old: {age}");
    }

    #[tokio::test]
    async fn test_ttl_expires_tiles() {
        let dir = TempDir::new().unwrap();
        let cache = MBTilesCache::with_options(
            dir.path().join("tiles.mbtiles"),
            true,
            Some(0.05),
            false,
            None,
        )
        .await
        .unwrap();

        let coord = TileCoord::new(0, 0, 1);
        let mut tile = png_tile(coord, 4);
        cache.store_tile(&mut tile).await.unwrap();
        assert!(cache.is_cached(&Tile::new(coord)).await.unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(!cache.is_cached(&Tile::new(coord)).await.unwrap());
        assert!(!cache.load_tile(&mut Tile::new(coord), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_level_cache_creates_per_level_files() {
        let dir = TempDir::new().unwrap();
        let cache = MBTilesLevelCache::new(dir.path());

        let mut t1 = png_tile(TileCoord::new(0, 0, 1), 1);
        let mut t2 = png_tile(TileCoord::new(0, 0, 2), 2);
        cache.store_tile(&mut t1).await.unwrap();
        cache.store_tile(&mut t2).await.unwrap();

        assert!(dir.path().join("1.mbtiles").exists());
        assert!(dir.path().join("2.mbtiles").exists());

        let mut loaded = Tile::new(TileCoord::new(0, 0, 2));
        assert!(cache.load_tile(&mut loaded, false).await.unwrap());

        assert!(cache
            .remove_level_tiles_before(1, None)
            .await
            .unwrap());
        assert!(!dir.path().join("1.mbtiles").exists());
    }
}
