//! Advisory file locks
//!
//! Serializes mutating actions on one site, and read-modify-write cycles on
//! the fallback store, across concurrent invocations. The lock is held for as
//! long as the [`FileLock`] value lives.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out waiting for lock {0}")]
    Timeout(PathBuf),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An exclusive lock on a file, released on drop
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    #[cfg(unix)]
    _file: std::fs::File,
}

impl FileLock {
    /// Wait up to `timeout` for the lock
    pub async fn acquire(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, LockError> {
        let path = path.as_ref();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                debug!(path = %path.display(), "Lock acquired");
                return Ok(lock);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout(path.to_path_buf()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl FileLock {
    /// Take the lock if it is free; `None` if another process holds it
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        use std::os::unix::io::AsRawFd;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            _file: file,
        }))
    }
}

#[cfg(not(unix))]
impl FileLock {
    /// Take the lock if it is free; `None` if the lock file already exists
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => Ok(Some(Self {
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(not(unix))]
impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Lock file guarding mutations of one site
pub fn site_lock_path(data_dir: &Path, slug: &str) -> PathBuf {
    data_dir.join("locks").join(format!("{}.lock", slug))
}

/// Lock file held from port assignment until the site is recorded.
///
/// The underscore keeps it apart from every slug's lock file.
pub fn port_lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join("locks").join("_ports.lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = site_lock_path(dir.path(), "demo");

        let held = FileLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        let err = FileLock::acquire(&path, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));

        drop(held);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_port_lock_is_separate_from_site_locks() {
        let dir = tempfile::tempdir().unwrap();
        let _site = FileLock::acquire(site_lock_path(dir.path(), "ports"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(FileLock::try_acquire(&port_lock_path(dir.path())).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/demo.lock");

        let held = FileLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let path = path.clone();
            tokio::spawn(async move { FileLock::acquire(&path, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(lock.path(), path.as_path());
    }
}
