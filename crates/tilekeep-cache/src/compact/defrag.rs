//! Defragmentation of compact bundles.
//!
//! Overwritten tiles leave their old bytes in the append-only data region;
//! bundles whose waste exceeds a percentage and an absolute minimum are
//! rewritten row by row into a fresh bundle that replaces the original.

use std::path::{Path, PathBuf};

use tracing::info;

use super::{Bundle, CompactCache, BUNDLE_GRID_HEIGHT, BUNDLE_GRID_WIDTH};
use crate::error::CacheResult;
use crate::lock::FileLock;

/// Outcome of a defragmentation run
#[derive(Debug, Clone, Copy, Default)]
pub struct DefragReport {
    /// Bundles inspected
    pub bundles: usize,
    /// Bundles rewritten
    pub defragmented: usize,
    /// Bytes reclaimed by rewriting
    pub reclaimed_bytes: u64,
}

/// Rewrite all bundles of `cache` whose wasted bytes exceed both
/// `min_percent` (fraction of the file size) and `min_bytes`.
///
/// With `dry_run` the fragmentation is only reported.
pub async fn defrag_compact_cache<B: Bundle>(
    cache: &CompactCache<B>,
    min_percent: f64,
    min_bytes: u64,
    dry_run: bool,
) -> CacheResult<DefragReport> {
    let mut report = DefragReport::default();

    for (base, offset) in list_bundles(cache.cache_dir())? {
        report.bundles += 1;

        let probe = B::open(base.clone(), offset);
        let (used, file_size) = tokio::task::spawn_blocking(move || probe.size()).await??;
        if file_size == 0 {
            continue;
        }
        let fragmentation = 1.0 - used as f64 / file_size as f64;
        let wasted = file_size - used;

        if fragmentation < min_percent || wasted < min_bytes {
            info!(
                bundle = %base.display(),
                fragmentation = %format!("{:.1}%", fragmentation * 100.0),
                wasted_kb = wasted / 1024,
                "skipping"
            );
            continue;
        }
        info!(
            bundle = %base.display(),
            fragmentation = %format!("{:.1}%", fragmentation * 100.0),
            wasted_kb = wasted / 1024,
            "defragmenting"
        );
        if dry_run {
            continue;
        }

        let bundle = B::open(base.clone(), offset);
        let _lock = FileLock::new(bundle.lock_path()).lock().await?;
        let tmp_base = cache.cache_dir().join("tmp_defrag");
        let reclaimed =
            tokio::task::spawn_blocking(move || rewrite_bundle(&bundle, &tmp_base, offset, wasted))
                .await??;
        report.defragmented += 1;
        report.reclaimed_bytes += reclaimed;
    }

    Ok(report)
}

fn rewrite_bundle<B: Bundle>(
    bundle: &B,
    tmp_base: &Path,
    offset: (u32, u32),
    wasted: u64,
) -> CacheResult<u64> {
    let tmp = B::open(tmp_base.to_path_buf(), offset);
    for path in tmp.file_paths() {
        let _ = std::fs::remove_file(&path);
    }

    let mut stored_tiles = false;
    for y in 0..BUNDLE_GRID_HEIGHT {
        for x in 0..BUNDLE_GRID_WIDTH {
            if let Some(data) = bundle.load_tile((x, y))? {
                tmp.store_tile((x, y), &data)?;
                stored_tiles = true;
            }
        }
    }

    // remove first: the bundle may be empty, and rename cannot replace
    // existing files everywhere
    for path in bundle.file_paths() {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
    }
    if stored_tiles {
        for (from, to) in tmp.file_paths().iter().zip(bundle.file_paths()) {
            if from.exists() {
                std::fs::rename(from, to)?;
            }
        }
    } else {
        for path in tmp.file_paths() {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(wasted)
}

/// All bundle base paths below `cache_dir` with their block offsets
fn list_bundles(cache_dir: &Path) -> CacheResult<Vec<(PathBuf, (u32, u32))>> {
    let mut bundles = Vec::new();
    let levels = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(bundles),
        Err(err) => return Err(err.into()),
    };
    for level in levels.flatten() {
        let name = level.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with('L') || !level.path().is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(level.path())?.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(offset) = bundle_offset(&file_name) else {
                continue;
            };
            let base = entry.path().with_extension("");
            bundles.push((base, offset));
        }
    }
    bundles.sort();
    Ok(bundles)
}

/// Block offset `(c, r)` from a bundle file name like `R0380C1380.bundle`
fn bundle_offset(file_name: &str) -> Option<(u32, u32)> {
    let stem = file_name.strip_suffix(".bundle")?;
    let rest = stem.strip_prefix('R')?;
    let c_pos = rest.find('C')?;
    let r = u32::from_str_radix(&rest[..c_pos], 16).ok()?;
    let c = u32::from_str_radix(&rest[c_pos + 1..], 16).ok()?;
    Some((c, r))
}
