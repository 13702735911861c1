//! File-based locking: per-tile locks, cross-process semaphores and
//! stale-lock cleanup

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use rand::Rng;
use tilekeep_grid::TileCoord;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::fs::ensure_directory;

/// Default time to wait for a lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Locks older than this are considered stale and swept
pub const MAX_LOCK_TIME: Duration = Duration::from_secs(300);

const DEFAULT_LOCK_STEP: Duration = Duration::from_millis(10);

/// An exclusive lock backed by a lock file.
///
/// The lock is taken by atomically creating the file and released by
/// removing it. Other processes polling the same path wait up to their
/// own timeout and then fail with [`CacheError::LockTimeout`]. Files left
/// behind by crashed processes are recovered by [`cleanup_lockdir`].
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    step: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            step: DEFAULT_LOCK_STEP,
        }
    }

    /// Time to wait before giving up with `LockTimeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll interval while the lock is taken by someone else
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    fn try_acquire(path: &Path) -> std::io::Result<std::fs::File> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let _ = write!(file, "{}", std::process::id());
        Ok(file)
    }

    /// Acquire the lock, waiting up to the configured timeout
    pub async fn lock(&self) -> CacheResult<LockGuard> {
        ensure_directory(&self.path, None)?;
        let give_up = Instant::now() + self.timeout;
        loop {
            match Self::try_acquire(&self.path) {
                Ok(_file) => {
                    debug!(path = %self.path.display(), "lock acquired");
                    return Ok(LockGuard {
                        path: Some(self.path.clone()),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= give_up {
                        return Err(CacheError::LockTimeout {
                            path: self.path.clone(),
                        });
                    }
                    tokio::time::sleep(self.step).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Releases its lock file when dropped
#[derive(Debug)]
pub struct LockGuard {
    path: Option<PathBuf>,
}

impl LockGuard {
    /// A guard that holds nothing; used by [`DummyLocker`]
    pub fn noop() -> Self {
        Self { path: None }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            // removal is best-effort: a raced removal by the sweeper is
            // indistinguishable from success
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Counting semaphore built from `n` file locks.
///
/// Acquisition probes the sub-locks in randomized rotation and fails with
/// `LockTimeout` only once all `n` are taken for the whole timeout.
#[derive(Debug, Clone)]
pub struct SemLock {
    path: PathBuf,
    n: usize,
    timeout: Duration,
    step: Duration,
}

impl SemLock {
    pub fn new(path: impl Into<PathBuf>, n: usize) -> Self {
        Self {
            path: path.into(),
            n: n.max(1),
            timeout: DEFAULT_LOCK_TIMEOUT,
            step: DEFAULT_LOCK_STEP,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Acquire one of the `n` slots
    pub async fn lock(&self) -> CacheResult<LockGuard> {
        ensure_directory(&self.path, None)?;
        let give_up = Instant::now() + self.timeout;
        let mut slot = rand::thread_rng().gen_range(0..self.n);
        loop {
            for _ in 0..self.n {
                let path = slot_path(&self.path, slot);
                match FileLock::try_acquire(&path) {
                    Ok(_file) => {
                        return Ok(LockGuard { path: Some(path) });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err.into()),
                }
                slot = (slot + 1) % self.n;
            }
            if Instant::now() >= give_up {
                return Err(CacheError::LockTimeout {
                    path: self.path.clone(),
                });
            }
            tokio::time::sleep(self.step).await;
        }
    }
}

fn slot_path(base: &Path, slot: usize) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(slot.to_string());
    PathBuf::from(name)
}

static CLEANUP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Remove lock files older than `max_lock_time` from `lockdir`.
///
/// Without `force` the sweep only runs on every 50th call, so routine lock
/// acquisitions pay for cleanup only occasionally.
pub fn cleanup_lockdir(lockdir: &Path, max_lock_time: Duration, force: bool) {
    if !force && CLEANUP_COUNTER.fetch_add(1, Ordering::Relaxed) % 50 != 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(lockdir) else {
        return;
    };
    let expire = SystemTime::now() - max_lock_time;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "lck") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        match meta.modified() {
            Ok(mtime) if mtime < expire => {
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), %err, "could not remove old lock file");
                    }
                }
            }
            _ => {}
        }
    }
}

/// Hands out locks keyed by tile coordinate
#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self, coord: TileCoord) -> CacheResult<LockGuard>;
}

/// Per-tile file locks in a shared lock directory.
///
/// The lock file name combines the backend's `lock_cache_id` with the tile
/// coordinate, so independent caches never contend.
#[derive(Debug, Clone)]
pub struct TileLocker {
    lock_dir: PathBuf,
    cache_id: String,
    timeout: Duration,
}

impl TileLocker {
    pub fn new(lock_dir: impl Into<PathBuf>, cache_id: impl Into<String>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            cache_id: cache_id.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lock file path for `coord`
    pub fn lock_path(&self, coord: TileCoord) -> PathBuf {
        self.lock_dir.join(format!(
            "{}-{}-{}-{}.lck",
            self.cache_id, coord.x, coord.y, coord.z
        ))
    }
}

#[async_trait]
impl Locker for TileLocker {
    async fn lock(&self, coord: TileCoord) -> CacheResult<LockGuard> {
        cleanup_lockdir(&self.lock_dir, MAX_LOCK_TIME, false);
        FileLock::new(self.lock_path(coord))
            .with_timeout(self.timeout)
            .lock()
            .await
    }
}

/// Locker that never blocks; used with the no-op cache backend
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyLocker;

#[async_trait]
impl Locker for DummyLocker {
    async fn lock(&self, _coord: TileCoord) -> CacheResult<LockGuard> {
        Ok(LockGuard::noop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_lock_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile.lck");
        let lock = FileLock::new(&path).with_timeout(Duration::from_millis(50));

        let guard = lock.lock().await.unwrap();
        assert!(path.exists());

        // a second locker times out while the first guard is held
        let second = FileLock::new(&path).with_timeout(Duration::from_millis(50));
        assert!(matches!(
            second.lock().await,
            Err(CacheError::LockTimeout { .. })
        ));

        drop(guard);
        assert!(!path.exists());
        second.lock().await.unwrap();
    }

    #[tokio::test]
    async fn test_semlock_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sem.lck");
        let sem = SemLock::new(&path, 2).with_timeout(Duration::from_millis(50));

        let g1 = sem.lock().await.unwrap();
        let g2 = sem.lock().await.unwrap();
        // both slots taken: the third locker fails within its timeout
        assert!(matches!(
            sem.lock().await,
            Err(CacheError::LockTimeout { .. })
        ));
        drop(g1);
        let _g3 = sem.lock().await.unwrap();
        drop(g2);
    }

    #[tokio::test]
    async fn test_cleanup_lockdir_removes_stale() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("old.lck");
        let other = dir.path().join("keep.dat");
        std::fs::write(&stale, b"1").unwrap();
        std::fs::write(&other, b"1").unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        cleanup_lockdir(dir.path(), Duration::from_secs(0), true);
        // only lock files are swept
        assert!(!stale.exists());
        assert!(other.exists());

        std::fs::write(&stale, b"1").unwrap();
        cleanup_lockdir(dir.path(), Duration::from_secs(3600), true);
        assert!(stale.exists());
    }

    #[tokio::test]
    async fn test_tile_locker_path() {
        let dir = tempdir().unwrap();
        let locker = TileLocker::new(dir.path(), "abc123");
        let path = locker.lock_path(TileCoord::new(3, 4, 2));
        assert_eq!(path.file_name().unwrap(), "abc123-3-4-2.lck");

        let _guard = locker.lock(TileCoord::new(3, 4, 2)).await.unwrap();
        assert!(path.exists());
    }
}
