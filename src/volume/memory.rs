//! In-process volume binding with failure injection

use super::{SnapshotInfo, VolumeBinding, VolumeError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredSnapshot {
    info: SnapshotInfo,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    filesystems: BTreeMap<String, Vec<StoredSnapshot>>,
    received: BTreeMap<String, Vec<Vec<u8>>>,
    clock: Option<DateTime<Utc>>,
    unavailable: HashSet<String>,
    fail_create: HashSet<String>,
    fail_destroy: HashSet<String>,
    delta_fails_after: Option<u64>,
}

/// Volume manager kept entirely in memory.
///
/// Snapshots carry an opaque payload; the delta between two snapshots is a
/// short header naming both ends followed by the target's payload.
#[derive(Debug, Default)]
pub struct MemoryVolume {
    state: Mutex<State>,
}

impl MemoryVolume {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an empty filesystem
    pub fn add_filesystem(&self, filesystem: &str) {
        self.state().filesystems.entry(filesystem.to_string()).or_default();
    }

    /// Add a snapshot with an empty payload
    pub fn add_snapshot(&self, filesystem: &str, name: &str, created: DateTime<Utc>, used_bytes: u64) {
        self.add_snapshot_with_payload(filesystem, name, created, used_bytes, Vec::new());
    }

    /// Add a snapshot whose delta stream will carry `payload`
    pub fn add_snapshot_with_payload(
        &self,
        filesystem: &str,
        name: &str,
        created: DateTime<Utc>,
        used_bytes: u64,
        payload: Vec<u8>,
    ) {
        let mut state = self.state();
        let snaps = state.filesystems.entry(filesystem.to_string()).or_default();
        snaps.push(StoredSnapshot {
            info: SnapshotInfo {
                name: name.to_string(),
                created,
                used_bytes,
            },
            payload,
        });
        snaps.sort_by(|a, b| a.info.created.cmp(&b.info.created));
    }

    /// Timestamp given to snapshots created through the binding
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state().clock = Some(now);
    }

    /// Make listing `filesystem` fail
    pub fn make_unavailable(&self, filesystem: &str) {
        self.state().unavailable.insert(filesystem.to_string());
    }

    /// Make creating any snapshot on `filesystem` fail
    pub fn fail_create_on(&self, filesystem: &str) {
        self.state().fail_create.insert(filesystem.to_string());
    }

    /// Make destroying `filesystem@name` fail
    pub fn fail_destroy_of(&self, filesystem: &str, name: &str) {
        self.state().fail_destroy.insert(format!("{}@{}", filesystem, name));
    }

    /// Make every delta stream fail after yielding `bytes` bytes
    pub fn fail_delta_after(&self, bytes: u64) {
        self.state().delta_fails_after = Some(bytes);
    }

    /// Names of the snapshots currently on `filesystem`, oldest first
    pub fn snapshot_names(&self, filesystem: &str) -> Vec<String> {
        self.state()
            .filesystems
            .get(filesystem)
            .map(|snaps| snaps.iter().map(|s| s.info.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Streams replayed into `filesystem` through [`VolumeBinding::apply_delta`]
    pub fn received_streams(&self, filesystem: &str) -> Vec<Vec<u8>> {
        self.state().received.get(filesystem).cloned().unwrap_or_default()
    }

    /// The exact bytes [`VolumeBinding::compute_delta`] yields for this pair
    pub fn expected_delta(&self, filesystem: &str, base: Option<&str>, target: &str) -> Option<Vec<u8>> {
        let state = self.state();
        let snaps = state.filesystems.get(filesystem)?;
        let target_snap = snaps.iter().find(|s| s.info.name == target)?;
        if let Some(base) = base {
            snaps.iter().find(|s| s.info.name == base)?;
        }

        let mut stream = format!("delta {}@{}..{}\n", filesystem, base.unwrap_or("-"), target).into_bytes();
        stream.extend_from_slice(&target_snap.payload);
        Some(stream)
    }
}

impl VolumeBinding for MemoryVolume {
    fn list_snapshots(&self, filesystem: &str) -> Result<Vec<SnapshotInfo>, VolumeError> {
        let state = self.state();
        if state.unavailable.contains(filesystem) {
            return Err(VolumeError::Rejected(format!("permission denied: {}", filesystem)));
        }
        state
            .filesystems
            .get(filesystem)
            .map(|snaps| snaps.iter().map(|s| s.info.clone()).collect())
            .ok_or_else(|| VolumeError::NotFound(filesystem.to_string()))
    }

    fn create_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError> {
        let mut state = self.state();
        if state.fail_create.contains(filesystem) {
            return Err(VolumeError::Rejected(format!("out of space: {}@{}", filesystem, name)));
        }
        let created = state.clock.unwrap_or_else(Utc::now);
        let snaps = state
            .filesystems
            .get_mut(filesystem)
            .ok_or_else(|| VolumeError::NotFound(filesystem.to_string()))?;
        if snaps.iter().any(|s| s.info.name == name) {
            return Err(VolumeError::Rejected(format!("snapshot exists: {}@{}", filesystem, name)));
        }
        snaps.push(StoredSnapshot {
            info: SnapshotInfo {
                name: name.to_string(),
                created,
                used_bytes: 0,
            },
            payload: Vec::new(),
        });
        snaps.sort_by(|a, b| a.info.created.cmp(&b.info.created));
        Ok(())
    }

    fn destroy_snapshot(&self, filesystem: &str, name: &str) -> Result<(), VolumeError> {
        let mut state = self.state();
        if state.fail_destroy.contains(&format!("{}@{}", filesystem, name)) {
            return Err(VolumeError::Rejected(format!("snapshot is busy: {}@{}", filesystem, name)));
        }
        let snaps = state
            .filesystems
            .get_mut(filesystem)
            .ok_or_else(|| VolumeError::NotFound(filesystem.to_string()))?;
        let before = snaps.len();
        snaps.retain(|s| s.info.name != name);
        if snaps.len() == before {
            return Err(VolumeError::NotFound(format!("{}@{}", filesystem, name)));
        }
        Ok(())
    }

    fn compute_delta(
        &self,
        filesystem: &str,
        base: Option<&str>,
        target: &str,
    ) -> Result<Box<dyn Read + Send>, VolumeError> {
        let stream = self
            .expected_delta(filesystem, base, target)
            .ok_or_else(|| VolumeError::NotFound(format!("{}@{}", filesystem, target)))?;

        match self.state().delta_fails_after {
            Some(limit) => Ok(Box::new(FailingReader {
                inner: Cursor::new(stream),
                remaining: limit,
            })),
            None => Ok(Box::new(Cursor::new(stream))),
        }
    }

    fn apply_delta(&self, filesystem: &str, stream: &mut dyn Read) -> Result<(), VolumeError> {
        let mut received = Vec::new();
        stream.read_to_end(&mut received)?;
        self.state()
            .received
            .entry(filesystem.to_string())
            .or_default()
            .push(received);
        Ok(())
    }
}

/// Yields `remaining` bytes, then fails
struct FailingReader {
    inner: Cursor<Vec<u8>>,
    remaining: u64,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "send stream interrupted"));
        }
        let limit = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..limit])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}
