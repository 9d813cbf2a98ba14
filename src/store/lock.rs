//! Advisory file locks with bounded acquisition.

use crate::errors::{Result, TaskerError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Lock flavour requested from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// A held advisory lock. Released on drop, including during unwinding.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Acquire a lock on `lock_path`, polling until `timeout` elapses.
    ///
    /// The lock file is created if missing. Timing out returns
    /// `TaskerError::LockTimeout`, which callers may retry.
    pub fn acquire(lock_path: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        if let Some(parent) = lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| TaskerError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)
            .map_err(|e| TaskerError::io(lock_path, e))?;

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => {
                    tracing::debug!(path = %lock_path.display(), ?mode, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                    return Ok(Self {
                        file,
                        path: lock_path.to_path_buf(),
                        mode,
                    });
                }
                Err(e) if is_contended(&e) => {
                    if started.elapsed() >= timeout {
                        tracing::warn!(path = %lock_path.display(), ?mode, "lock acquisition timed out");
                        return Err(TaskerError::LockTimeout {
                            path: lock_path.to_path_buf(),
                            timeout,
                        });
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(TaskerError::io(lock_path, e)),
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.lock");
        let a = FileLock::acquire(&path, LockMode::Shared, Duration::from_secs(1)).unwrap();
        let b = FileLock::acquire(&path, LockMode::Shared, Duration::from_millis(200)).unwrap();
        assert_eq!(a.mode(), LockMode::Shared);
        assert_eq!(b.mode(), LockMode::Shared);
    }

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.lock");
        let _held = FileLock::acquire(&path, LockMode::Exclusive, Duration::from_secs(1)).unwrap();

        let err = FileLock::acquire(&path, LockMode::Shared, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TaskerError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.lock");
        {
            let _held =
                FileLock::acquire(&path, LockMode::Exclusive, Duration::from_secs(1)).unwrap();
        }
        let again = FileLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(50));
        assert!(again.is_ok());
    }

    #[test]
    fn test_creates_missing_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.lock");
        let lock = FileLock::acquire(&path, LockMode::Exclusive, Duration::from_secs(1)).unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert!(path.exists());
    }
}
