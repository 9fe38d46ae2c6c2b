//! Cross-process reconcile lock
//!
//! The CLI, the daemon and the web layer's helper invocations may all try to
//! reconcile at once. An advisory `flock` on a well-known file serialises
//! them; the in-process gate of the reconciler covers tasks inside one
//! process.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot open lock file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("lock {path} is held by another process")]
    Busy { path: PathBuf },

    #[error("flock on {path} failed: {source}")]
    Flock { path: PathBuf, source: io::Error },
}

/// Held for the lifetime of the value
#[derive(Debug)]
pub struct ReconcileLock {
    file: File,
    path: PathBuf,
}

impl ReconcileLock {
    /// Take the lock or fail immediately
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        // SAFETY: the descriptor is owned by `file` and stays open while the lock is held
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                LockError::Busy {
                    path: path.to_path_buf(),
                }
            } else {
                LockError::Flock {
                    path: path.to_path_buf(),
                    source: err,
                }
            });
        }

        debug!(path = %path.display(), "Reconcile lock taken");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Wait up to `timeout` for the lock
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_acquire(path) {
                Err(LockError::Busy { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReconcileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(path = %self.path.display(), "Failed to release reconcile lock");
        }
    }
}
