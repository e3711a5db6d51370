//! Named advisory locks over files in the store.
//!
//! All mutating store operations serialize on [`GLOBAL_LOCK_KEY`]. A
//! [`LockHandle`] releases its flock when dropped, so the lock cannot
//! leak across early returns or panics; `unlock` is the explicit path.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use nix::fcntl::{flock, FlockArg};
use thiserror::Error;
use tracing::debug;

/// The key serializing create, destroy, and collect against each other.
pub const GLOBAL_LOCK_KEY: &str = "global";

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("creating lock file `{path}`: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("acquiring lock `{key}`: {source}")]
    Acquire {
        key: String,
        #[source]
        source: nix::Error,
    },
}

/// Exclusive ownership of a named lock. Dropping the handle releases it.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    file: File,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        debug!(key = %self.key, "lock released");
    }
}

/// Named-lock service.
pub trait Locksmith: Send + Sync {
    /// Block until exclusive ownership of `key` is acquired.
    fn lock(&self, key: &str) -> Result<LockHandle, LockError>;

    /// Release a handle. Idempotent by construction: the handle is
    /// consumed and its flock dropped.
    fn unlock(&self, handle: LockHandle);
}

/// Locks backed by flock(2) over files in a single directory.
pub struct FileLocksmith {
    locks_dir: PathBuf,
}

impl FileLocksmith {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self { locks_dir }
    }
}

impl Locksmith for FileLocksmith {
    fn lock(&self, key: &str) -> Result<LockHandle, LockError> {
        let path = self.locks_dir.join(key);

        fs::create_dir_all(&self.locks_dir).map_err(|source| LockError::CreateFile {
            path: self.locks_dir.clone(),
            source,
        })?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::CreateFile {
                path: path.clone(),
                source,
            })?;

        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|source| {
            LockError::Acquire {
                key: key.to_string(),
                source,
            }
        })?;

        debug!(key = %key, path = %path.display(), "lock acquired");

        Ok(LockHandle {
            key: key.to_string(),
            file,
        })
    }

    fn unlock(&self, handle: LockHandle) {
        drop(handle);
    }
}
