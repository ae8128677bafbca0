//! Directory-based cross-process locks with stale-lock reclamation.
//!
//! A lock for `state.json` is the directory `state.json.lock`. Creating a
//! directory is atomic on every filesystem we target, so a failed
//! `create_dir` with `AlreadyExists` is the contention signal. The directory's
//! modification time is the acquisition timestamp; a lock older than the
//! staleness threshold is assumed to belong to a crashed holder and removed.
//!
//! An `owner` file inside the directory records who holds it, so releasing a
//! lock that has since been reclaimed by someone else leaves theirs alone.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{StoreError, StoreResult};

/// Suffix appended to the protected file's path to name its lock directory.
pub const LOCK_SUFFIX: &str = ".lock";
const OWNER_FILE: &str = "owner";

/// Tuning for acquisition retries.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub stale_after: Duration,
    pub max_attempts: u32,
    pub retry_min: Duration,
    pub retry_max: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            stale_after: config.stale_after(),
            max_attempts: config.max_attempts.max(1),
            retry_min: Duration::from_millis(config.retry_min_ms),
            retry_max: Duration::from_millis(config.retry_max_ms.max(config.retry_min_ms)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    token: String,
}

/// Lock directory path for a protected file.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(LOCK_SUFFIX);
    PathBuf::from(os)
}

/// Unique sibling a stale lock directory is renamed to before removal.
fn tombstone_path_for(lock_dir: &Path) -> PathBuf {
    let mut os = lock_dir.as_os_str().to_os_string();
    os.push(format!(".{}.stale", Uuid::new_v4().simple()));
    PathBuf::from(os)
}

/// Age of a lock directory by mtime, or `None` when it does not exist.
async fn lock_age(lock_dir: &Path) -> StoreResult<Option<Duration>> {
    let modified = match tokio::fs::metadata(lock_dir).await {
        Ok(meta) => meta
            .modified()
            .map_err(|e| StoreError::io("reading lock mtime", lock_dir, e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io("inspecting lock directory", lock_dir, e)),
    };
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    ))
}

/// Proof of a held lock. Dropping it without [`LockManager::release`]
/// releases synchronously.
#[derive(Debug)]
pub struct LockHandle {
    lock_dir: PathBuf,
    token: String,
    released: bool,
}

impl LockHandle {
    /// The lock directory this handle owns.
    pub fn path(&self) -> &Path {
        &self.lock_dir
    }

    fn owns(&self, owner: &str) -> bool {
        serde_json::from_str::<LockOwner>(owner)
            .map(|o| o.token == self.token)
            .unwrap_or(false)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let owner_path = self.lock_dir.join(OWNER_FILE);
        if let Ok(owner) = std::fs::read_to_string(owner_path) {
            if self.owns(&owner) {
                let _ = std::fs::remove_dir_all(&self.lock_dir);
            }
        }
    }
}

/// Acquires and releases directory locks.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    options: LockOptions,
}

impl LockManager {
    pub fn new(options: LockOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire the lock protecting `path`, retrying with randomized backoff.
    pub async fn acquire(&self, path: &Path) -> StoreResult<LockHandle> {
        let lock_dir = lock_path_for(path);
        if let Some(parent) = lock_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("creating lock parent directory", parent, e))?;
        }

        let mut attempts = 0;
        while attempts < self.options.max_attempts {
            attempts += 1;
            match tokio::fs::create_dir(&lock_dir).await {
                Ok(()) => {
                    let handle = self.claim(lock_dir).await?;
                    debug!(lock = %handle.lock_dir.display(), attempts, "lock acquired");
                    return Ok(handle);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale(&lock_dir).await? {
                        continue;
                    }
                    tokio::time::sleep(self.backoff()).await;
                }
                Err(e) => {
                    return Err(StoreError::io("creating lock directory", &lock_dir, e));
                }
            }
        }

        Err(StoreError::LockTimeout {
            path: lock_dir,
            attempts,
        })
    }

    /// Release a held lock. A lock no longer owned by `handle` (reclaimed as
    /// stale, or already gone) is left untouched.
    pub async fn release(&self, mut handle: LockHandle) -> StoreResult<()> {
        handle.released = true;
        let owner_path = handle.lock_dir.join(OWNER_FILE);
        let owner = match tokio::fs::read_to_string(&owner_path).await {
            Ok(owner) => owner,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(lock = %handle.lock_dir.display(), "lock already gone");
                return Ok(());
            }
            Err(e) => return Err(StoreError::io("reading lock owner", owner_path, e)),
        };
        if !handle.owns(&owner) {
            debug!(lock = %handle.lock_dir.display(), "lock reclaimed by another holder");
            return Ok(());
        }

        match tokio::fs::remove_dir_all(&handle.lock_dir).await {
            Ok(()) => {
                debug!(lock = %handle.lock_dir.display(), "lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("removing lock directory", &handle.lock_dir, e)),
        }
    }

    /// Run `body` while holding the lock for `path`. The lock is released on
    /// every exit path; the body's error takes precedence over a release error.
    pub async fn with_lock<T, F, Fut>(&self, path: &Path, body: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let handle = self.acquire(path).await?;
        let result = body().await;
        let released = self.release(handle).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }

    async fn claim(&self, lock_dir: PathBuf) -> StoreResult<LockHandle> {
        let owner = LockOwner {
            pid: std::process::id(),
            token: Uuid::new_v4().simple().to_string(),
        };
        let owner_path = lock_dir.join(OWNER_FILE);
        let body = serde_json::to_vec(&owner).map_err(|e| StoreError::serialize(&owner_path, e))?;
        if let Err(e) = tokio::fs::write(&owner_path, body).await {
            let _ = tokio::fs::remove_dir_all(&lock_dir).await;
            return Err(StoreError::io("writing lock owner", owner_path, e));
        }
        Ok(LockHandle {
            lock_dir,
            token: owner.token,
            released: false,
        })
    }

    /// Returns true when the caller should retry immediately: the lock was
    /// stale and has been removed, or it vanished in the meantime.
    ///
    /// The stale directory is renamed to a unique tombstone before removal, so
    /// only one waiter ever retires a given lock instance. Another waiter may
    /// reclaim and re-create the lock between our age check and the rename;
    /// the tombstone's age is checked again and a fresh lock is put back. If a
    /// third holder creates the lock before it can be put back, the moved lock
    /// is dropped and its holder overlaps with the new one.
    async fn reclaim_if_stale(&self, lock_dir: &Path) -> StoreResult<bool> {
        let age = match lock_age(lock_dir).await? {
            Some(age) => age,
            None => return Ok(true),
        };
        if age < self.options.stale_after {
            return Ok(false);
        }

        warn!(lock = %lock_dir.display(), age_secs = age.as_secs(), "reclaiming stale lock");
        let tombstone = tombstone_path_for(lock_dir);
        match tokio::fs::rename(lock_dir, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(StoreError::io("retiring stale lock", lock_dir, e)),
        }
        self.settle_tombstone(lock_dir, &tombstone).await
    }

    /// Remove a retired lock, unless it turns out to be a live one that was
    /// moved by mistake, in which case it is restored and false is returned.
    async fn settle_tombstone(&self, lock_dir: &Path, tombstone: &Path) -> StoreResult<bool> {
        let fresh = matches!(
            lock_age(tombstone).await?,
            Some(age) if age < self.options.stale_after
        );
        if fresh {
            match tokio::fs::rename(tombstone, lock_dir).await {
                Ok(()) => {
                    debug!(lock = %lock_dir.display(), "restored live lock");
                    return Ok(false);
                }
                Err(e) => {
                    warn!(lock = %lock_dir.display(), error = %e, "could not restore live lock");
                }
            }
        }
        match tokio::fs::remove_dir_all(tombstone).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(StoreError::io("removing stale lock", tombstone, e)),
        }
    }

    fn backoff(&self) -> Duration {
        let min = self.options.retry_min.as_millis() as u64;
        let max = self.options.retry_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
    }
}
