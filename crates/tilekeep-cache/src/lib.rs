//! # TileKeep Cache
//!
//! Storage backends for the TileKeep cache engine: the polymorphic
//! [`TileStore`] contract, a hierarchical file backend with single-color
//! deduplication, the compact bundle backends (v1 and v2, including
//! defragmentation), MBTiles backends and the locking layer used to
//! coordinate tile creation across threads and processes.

pub mod compact;
pub mod dummy;
pub mod error;
pub mod file;
pub mod lock;
pub mod mbtiles;
pub mod path;
pub mod store;
pub mod tile;

pub(crate) mod fs;

pub use compact::{defrag_compact_cache, CompactCacheV1, CompactCacheV2, DefragReport};
pub use dummy::DummyCache;
pub use error::{CacheError, CacheResult};
pub use file::{FileCache, LinkMode};
pub use lock::{cleanup_lockdir, DummyLocker, FileLock, LockGuard, Locker, SemLock, TileLocker};
pub use mbtiles::{MBTilesCache, MBTilesLevelCache};
pub use path::DirectoryLayout;
pub use store::TileStore;
pub use tile::{now_timestamp, Tile, TileCollection};
