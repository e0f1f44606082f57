//! Backup command implementation.

use super::{format_bytes, ConsoleProgress, Context};
use crate::archive::BackupDestination;
use crate::backup::{BackupPipeline, BackupProgress, BackupRequest};
use crate::catalog;
use crate::snapshot::Snapshot;
use anyhow::{bail, Context as _, Result};
use clap::Args;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Filesystem to back up
    pub filesystem: String,

    /// Directory holding sealed backups (default: `backup.destination`)
    #[arg(short, long)]
    pub destination: Option<PathBuf>,

    /// Key file (default: `backup.key_file`)
    #[arg(short, long)]
    pub key_file: Option<PathBuf>,

    /// Snapshot to back up (default: the newest)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Snapshot the delta starts from (default: target of the latest backup in the destination)
    #[arg(short, long, conflicts_with = "full")]
    pub base: Option<String>,

    /// Back up the full stream instead of a delta
    #[arg(long)]
    pub full: bool,

    /// Do not print per-chunk progress
    #[arg(long)]
    pub no_progress: bool,
}

/// Run the backup command
pub fn run(args: BackupArgs, ctx: &Context) -> Result<ExitCode> {
    ctx.config.validate()?;
    let destination_dir = args
        .destination
        .clone()
        .or_else(|| ctx.config.backup.destination.clone())
        .context("no destination given (use --destination or set backup.destination)")?;
    let key = ctx.load_key(args.key_file.as_deref())?;
    let zfs = ctx.config.zfs_command();
    let destination = BackupDestination::new(&destination_dir)?;

    let snapshots = catalog::load(&zfs, &args.filesystem)?;
    let target = match &args.target {
        Some(name) => {
            if catalog::find(&snapshots, name).is_none() {
                bail!("snapshot {}@{} does not exist", args.filesystem, name);
            }
            name.clone()
        }
        None => match snapshots.last() {
            Some(newest) => newest.name.clone(),
            None => bail!("{} has no snapshots to back up", args.filesystem),
        },
    };

    let base = if args.full {
        None
    } else if let Some(name) = &args.base {
        if catalog::find(&snapshots, name).is_none() {
            bail!("base snapshot {}@{} does not exist", args.filesystem, name);
        }
        Some(name.clone())
    } else {
        let previous = destination.latest_for(&args.filesystem)?;
        let base = previous.and_then(|(_, manifest)| {
            default_base(&snapshots, &target, &manifest.target_snapshot)
        });
        if let Some(base) = &base {
            info!("Using {} from the previous backup as base", base);
        }
        base
    };

    let request = match &base {
        Some(base) => BackupRequest::incremental(&args.filesystem, base, &target),
        None => BackupRequest::full(&args.filesystem, &target),
    };

    match &request.base_snapshot {
        Some(base) => println!(
            "Starting incremental backup: {}@{} -> @{} into {}",
            request.filesystem,
            base,
            request.target_snapshot,
            destination_dir.display()
        ),
        None => println!(
            "Starting full backup: {}@{} into {}",
            request.filesystem,
            request.target_snapshot,
            destination_dir.display()
        ),
    }

    let mut sink = destination.create_sink(&request.filesystem, &request.target_snapshot)?;
    let pipeline = BackupPipeline::new(ctx.config.backup_options()).with_cancellation(ctx.cancel.clone());
    let mut console = ConsoleProgress::new();
    let mut quiet = ();
    let progress: &mut dyn BackupProgress = if args.no_progress { &mut quiet } else { &mut console };

    let manifest = pipeline.backup_from_volume(&zfs, &request, &key, &mut sink, progress)?;

    println!("Backup completed successfully!");
    println!("  Backup ID: {}", manifest.backup_id);
    println!("  Manifest: {}", sink.manifest_path().display());
    println!("  Chunks: {}", manifest.chunks.len());
    println!("  Delta size: {}", format_bytes(manifest.total_plaintext_size));
    println!("  Stored size: {}", format_bytes(manifest.data_len()));
    println!("  Checksum: {}", manifest.aggregate_checksum);

    Ok(ExitCode::SUCCESS)
}

/// The previous backup's target can serve as base only while it still exists
/// and is older than `target`
fn default_base(snapshots: &[Snapshot], target: &str, previous_target: &str) -> Option<String> {
    let target = catalog::find(snapshots, target)?;
    let previous = catalog::find(snapshots, previous_target)?;
    (previous.created < target.created).then(|| previous.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn snapshots() -> Vec<Snapshot> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ["2024-01-01", "2024-01-02", "2024-01-03"]
            .iter()
            .enumerate()
            .map(|(i, name)| Snapshot {
                filesystem: "tank/home".to_string(),
                name: name.to_string(),
                created: start + Duration::days(i as i64),
                used_bytes: 0,
            })
            .collect()
    }

    #[test]
    fn test_default_base_is_an_older_snapshot() {
        let snapshots = snapshots();
        assert_eq!(
            default_base(&snapshots, "2024-01-03", "2024-01-02"),
            Some("2024-01-02".to_string())
        );
        // Latest backup is newer than the requested target
        assert_eq!(default_base(&snapshots, "2024-01-01", "2024-01-03"), None);
        assert_eq!(default_base(&snapshots, "2024-01-02", "2024-01-02"), None);
        // Previous target has been destroyed since
        assert_eq!(default_base(&snapshots, "2024-01-03", "2023-12-31"), None);
    }
}
