//! Advisory file locks
//!
//! Host-wide mutual exclusion built on `flock(2)`. Locks are tied to an open
//! file description, so two handles in the same process exclude each other
//! just like two processes do. The lock is released when the guard drops.

use rustix::fs::{flock, FlockOperation};
use rustix::io::Errno;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::LockError;

/// Guard holding an exclusive `flock` on a lock file
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        loop {
            match flock(&file, FlockOperation::LockExclusive) {
                Ok(()) => break,
                Err(Errno::INTR) => continue,
                Err(e) => return Err(io_error(path, e)),
            }
        }
        tracing::debug!(path = %path.display(), "Acquired lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock if free, otherwise fail with [`LockError::Contended`]
    pub fn try_acquire(path: &Path, resource: &str) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(Errno::WOULDBLOCK) => Err(LockError::Contended {
                resource: resource.to_string(),
            }),
            Err(e) => Err(io_error(path, e)),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, FlockOperation::Unlock);
    }
}

/// Lock file name for a device path (`/dev/sdb` -> `dev-sdb.lock`)
pub fn device_lock_name(device_path: &str) -> String {
    let name: String = device_path
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{name}.lock")
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
            path: parent.to_path_buf(),
            error: e.to_string(),
        })?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
}

fn io_error(path: &Path, errno: Errno) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        error: std::io::Error::from(errno).to_string(),
    }
}
