//! # TileKeep Engine
//!
//! The read pipeline of the TileKeep cache engine: the [`TileManager`]
//! resolves tile requests against a storage backend, coordinates
//! concurrent creation through the locking layer, fetches misses from
//! upstream sources (single-tile, meta-tile or bulk), rescales from
//! adjacent zoom levels and applies coverage clipping and expiry rules.

pub mod creator;
pub mod error;
pub mod manager;
pub mod source;

pub use error::{EngineError, Result};
pub use manager::{
    CacheSession, ExpirePolicy, TileFilter, TileManager, TileManagerBuilder,
};
pub use source::{MapQuery, MapSource, SourceError, TileAccess};
