//! Advisory exclusive file locking for tape writes, mirroring the
//! workspace's database-lock pattern: a sidecar `.lockfile` coordinates
//! writers, the data file itself is untouched until the write completes.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::StoreError;

/// A held exclusive lock on a tape path's `.lockfile` sidecar. Released on drop.
pub struct TapeLockGuard {
    _file: File,
    lock_path: PathBuf,
}

impl TapeLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl std::fmt::Debug for TapeLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapeLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Bounded exponential backoff used while waiting for a tape's lock.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            attempts: 8,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

/// `<tape_path>.lockfile`, per the tape store's on-disk layout contract.
pub fn lock_path_for(tape_path: &Path) -> PathBuf {
    let mut os = tape_path.as_os_str().to_os_string();
    os.push(".lockfile");
    PathBuf::from(os)
}

/// Acquire an exclusive lock on `tape_path`, retrying with backoff until
/// `budget` is exhausted.
pub fn lock_exclusive(tape_path: &Path, budget: &RetryBudget) -> Result<TapeLockGuard, StoreError> {
    let lock_path = lock_path_for(tape_path);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| StoreError::Io {
            path: lock_path.clone(),
            op: "open lockfile",
            source,
        })?;

    let mut delay = budget.initial_delay;
    for attempt in 0..budget.attempts {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %lock_path.display(), "acquired tape lock");
                return Ok(TapeLockGuard {
                    _file: file,
                    lock_path,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if attempt + 1 == budget.attempts {
                    return Err(StoreError::Lock {
                        path: tape_path.to_path_buf(),
                    });
                }
                thread::sleep(delay);
                delay = (delay * 2).min(budget.max_delay);
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: lock_path,
                    op: "lock_exclusive",
                    source,
                })
            }
        }
    }
    Err(StoreError::Lock {
        path: tape_path.to_path_buf(),
    })
}
