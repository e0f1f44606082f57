//! # zsnapmgr
//!
//! ZFS snapshot retention manager with verified, encrypted incremental backups.
//!
//! ## Features
//!
//! - **Retention**: age buckets with per-bucket counts, spread evenly over time
//! - **Scheduling**: one managed snapshot per period, pruned by policy under a per-filesystem lock
//! - **Backup**: the snapshot delta stream split into chunks, compressed with zstd and sealed with ChaCha20-Poly1305
//! - **Restore**: every chunk checked against its manifest before any byte is emitted
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zsnapmgr::archive::BackupDestination;
//! use zsnapmgr::backup::{BackupPipeline, BackupRequest};
//! use zsnapmgr::crypto::BackupKey;
//! use zsnapmgr::volume::ZfsCommand;
//!
//! # fn main() -> zsnapmgr::Result<()> {
//! let zfs = ZfsCommand::default();
//! let key = BackupKey::from_file("/etc/zsnapmgr/backup.key")?;
//! let destination = BackupDestination::new("/mnt/backup")?;
//!
//! let request = BackupRequest::incremental("tank/home", "2024-01-01", "2024-01-02");
//! let mut sink = destination.create_sink(&request.filesystem, &request.target_snapshot)?;
//! let manifest = BackupPipeline::default().backup_from_volume(&zfs, &request, &key, &mut sink, &mut ())?;
//! println!("Sealed {} chunks", manifest.chunks.len());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod backup;
pub mod cancel;
pub mod catalog;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod volume;

// Re-export commonly used types
pub use archive::{BackupDestination, BackupSink};
pub use backup::{BackupOptions, BackupPipeline, BackupRequest};
pub use cancel::CancellationToken;
pub use config::Config;
pub use crypto::BackupKey;
pub use error::{Error, Result};
pub use manifest::BackupManifest;
pub use restore::{RestorePipeline, RestoreStream};
pub use retention::{RetentionBucket, RetentionPolicy};
pub use scheduler::{RunReport, SchedulerOptions, SnapshotScheduler};
pub use snapshot::{Snapshot, SnapshotPeriod};
pub use volume::{MemoryVolume, VolumeBinding, ZfsCommand};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
