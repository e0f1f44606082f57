//! Error types for zsnapmgr

use crate::volume::VolumeError;
use std::io;
use thiserror::Error;

/// Main error type for snapshot management and backup operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Snapshot catalog unavailable for {filesystem}: {source}")]
    CatalogUnavailable {
        filesystem: String,
        #[source]
        source: VolumeError,
    },

    #[error("Invalid retention policy: {reason}")]
    InvalidPolicy { reason: String },

    #[error("Failed to create snapshot {snapshot}: {source}")]
    SnapshotCreateFailed {
        snapshot: String,
        #[source]
        source: VolumeError,
    },

    #[error("Failed to destroy snapshot {snapshot}: {source}")]
    SnapshotDestroyFailed {
        snapshot: String,
        #[source]
        source: VolumeError,
    },

    #[error("Filesystem {filesystem} is locked by another run")]
    FilesystemBusy { filesystem: String },

    #[error("Delta stream failed after {bytes_read} bytes: {source}")]
    DeltaStreamError {
        bytes_read: u64,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write backup output: {0}")]
    SinkWriteError(#[source] io::Error),

    #[error("Chunk {index} is corrupt: {reason}")]
    ChunkCorrupt { index: u64, reason: String },

    #[error("Authentication failed for chunk {index}: wrong key or tampered data")]
    AuthenticationFailed { index: u64 },

    #[error("Manifest has been tampered with: {reason}")]
    ManifestTampered { reason: String },

    #[error("Invalid manifest format: {reason}")]
    InvalidManifest { reason: String },

    #[error("Manifest not found: {path}")]
    ManifestNotFound { path: String },

    #[error("Invalid key material: {reason}")]
    KeyMaterial { reason: String },

    #[error("Failed to encrypt chunk {index}")]
    EncryptionFailed { index: u64 },

    #[error("Volume operation failed: {0}")]
    Volume(#[from] VolumeError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap this error so it can travel through `std::io::Read`.
    pub fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => e,
            other => io::Error::other(other),
        }
    }

    /// Recover a typed error from an `io::Error` produced by [`Error::into_io`].
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            return Error::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(typed)) => *typed,
            Some(Err(inner)) => Error::Io(io::Error::other(inner)),
            None => Error::Io(io::Error::from(io::ErrorKind::Other)),
        }
    }

    /// Whether this error means the archive or its manifest failed verification.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Error::ChunkCorrupt { .. }
                | Error::AuthenticationFailed { .. }
                | Error::ManifestTampered { .. }
        )
    }
}

/// Result type alias for zsnapmgr operations
pub type Result<T> = std::result::Result<T, Error>;
