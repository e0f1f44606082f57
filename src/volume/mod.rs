//! Boundary to the storage volume manager.
//!
//! Everything that touches the copy-on-write pool goes through [`VolumeBinding`]:
//! listing, creating and destroying snapshots, and producing or replaying the
//! delta stream between two snapshots. [`ZfsCommand`] drives the `zfs` tool;
//! [`MemoryVolume`] keeps everything in process.

mod memory;
mod zfs;

pub use memory::MemoryVolume;
pub use zfs::ZfsCommand;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use thiserror::Error;

/// Errors reported by a volume binding
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from {command}: {line}")]
    Parse { command: String, line: String },

    #[error("dataset does not exist: {0}")]
    NotFound(String),

    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One snapshot as reported by the volume manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot name without the `filesystem@` prefix
    pub name: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Space referenced only by this snapshot, in bytes
    pub used_bytes: u64,
}

/// Operations the snapshot manager needs from the storage layer.
///
/// Implementations are not required to be safe under concurrent mutation of
/// one filesystem; callers serialize per filesystem.
pub trait VolumeBinding: Send + Sync {
    /// List snapshots of `filesystem`, oldest first.
    fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotInfo>, VolumeError>;

    /// Create `filesystem@name`.
    fn create_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError>;

    /// Destroy `filesystem@name`.
    fn destroy_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError>;

    /// Open the stream of changes from `base` to `target`. With no base the
    /// stream is a full replication stream of `target`.
    fn compute_delta(
        &self,
        filesystem: &str,
        base: Option<&str>,
        target: &str,
    ) -> Result<Box<dyn Read + Send>, VolumeError>;

    /// Replay a stream produced by [`VolumeBinding::compute_delta`] into `filesystem`.
    fn apply_delta(&self, filesystem: &str, stream: &mut dyn Read) -> Result<(), VolumeError>;
}

impl<T: VolumeBinding + ?Sized> VolumeBinding for &T {
    fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotInfo>, VolumeError> {
        (**self).list_snapshots(filesystem)
    }

    fn create_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError> {
        (**self).create_snapshot(filesystem, name)
    }

    fn destroy_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError> {
        (**self).destroy_snapshot(filesystem, name)
    }

    fn compute_delta(
        &self,
        filesystem: &str,
        base: Option<&str>,
        target: &str,
    ) -> Result<Box<dyn Read + Send>, VolumeError> {
        (**self).compute_delta(filesystem, base, target)
    }

    fn apply_delta(&self, filesystem: &str, stream: &mut dyn Read) -> Result<(), VolumeError> {
        (**self).apply_delta(filesystem, stream)
    }
}
