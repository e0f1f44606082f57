//! Per-filesystem advisory locks

use crate::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive `flock` on `<lock_dir>/<filesystem>.lock`, released on drop.
///
/// Only one run may hold the lock for a given filesystem; the lock is
/// advisory and shared by every process using the same lock directory.
#[derive(Debug)]
pub struct FilesystemLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl FilesystemLock {
    /// Take the lock without waiting; contention yields `FilesystemBusy`
    pub fn acquire(lock_dir: &Path, filesystem: &str) -> Result<Self> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_path(lock_dir, filesystem);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Locked {} via {}", filesystem, path.display());
                Ok(Self { path, _lock: lock })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(Error::FilesystemBusy {
                filesystem: filesystem.to_string(),
            }),
            Err((_, errno)) => Err(Error::Io(errno.into())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lock file for a filesystem; `/` in dataset names becomes `_`
pub fn lock_path(lock_dir: &Path, filesystem: &str) -> PathBuf {
    lock_dir.join(format!("{}.lock", filesystem.replace('/', "_")))
}
