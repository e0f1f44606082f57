//! Command-line interface for zsnapmgr.
//!
//! Each subcommand lives in its own module with an `XxxArgs` struct and a
//! `run` function. Commands return the process exit code; errors that abort a
//! command bubble up through `anyhow`.

use crate::backup::BackupProgress;
use crate::cancel::CancellationToken;
use crate::chunk::ChunkDescriptor;
use crate::config::Config;
use crate::crypto::BackupKey;
use crate::logging::LogFormat;
use crate::manifest::BackupManifest;
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

pub mod automanage;
pub mod backup;
pub mod keygen;
pub mod restore;
pub mod snapshots;
pub mod verify;

/// zsnapmgr - ZFS snapshot retention and encrypted incremental backups
#[derive(Parser)]
#[command(name = "zsnapmgr")]
#[command(about = "ZFS snapshot retention manager with verified, encrypted incremental backups")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(long, short = 'c', global = true, env = "ZSNAPMGR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text or json (overrides the config file)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Only log warnings and errors
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log debug output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Take the period snapshot and prune old ones
    Automanage(automanage::AutomanageArgs),
    /// List snapshots with their retention decisions
    Snapshots(snapshots::SnapshotsArgs),
    /// Back up a snapshot delta into a destination directory
    Backup(backup::BackupArgs),
    /// Verify a backup and replay it into a filesystem or a file
    Restore(restore::RestoreArgs),
    /// Verify a backup without restoring it
    Verify(verify::VerifyArgs),
    /// Generate a new backup key file
    Keygen(keygen::KeygenArgs),
}

/// State shared by every command
pub struct Context {
    pub config: Config,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Key from `explicit`, else from `backup.key_file` in the config
    pub fn load_key(&self, explicit: Option<&Path>) -> Result<BackupKey> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| self.config.backup.key_file.clone())
            .context("no key file given (use --key-file or set backup.key_file)")?;
        BackupKey::from_file(&path).with_context(|| format!("loading key from {}", path.display()))
    }
}

/// Progress reporter printing one line per chunk
pub struct ConsoleProgress {
    chunks: u64,
    plaintext_bytes: u64,
    stored_bytes: u64,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            chunks: 0,
            plaintext_bytes: 0,
            stored_bytes: 0,
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupProgress for ConsoleProgress {
    fn on_chunk(&mut self, descriptor: &ChunkDescriptor) {
        self.chunks += 1;
        self.plaintext_bytes += descriptor.plaintext_size;
        self.stored_bytes += descriptor.ciphertext_size;
        println!(
            "  chunk {:>6}  {:>10} -> {:>10}  (total {})",
            descriptor.sequence_index,
            format_bytes(descriptor.plaintext_size),
            format_bytes(descriptor.ciphertext_size),
            format_bytes(self.plaintext_bytes)
        );
    }

    fn on_complete(&mut self, manifest: &BackupManifest) {
        debug_assert_eq!(self.chunks, manifest.chunks.len() as u64);
        let ratio = if self.plaintext_bytes > 0 {
            self.stored_bytes as f64 / self.plaintext_bytes as f64 * 100.0
        } else {
            0.0
        };
        println!(
            "Sealed {} chunks: {} of delta stored in {} ({:.1}%)",
            self.chunks,
            format_bytes(self.plaintext_bytes),
            format_bytes(self.stored_bytes),
            ratio
        );
    }
}

/// Format bytes in human readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.0 MiB");
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup_command() {
        let cli = Cli::try_parse_from([
            "zsnapmgr",
            "--log-format",
            "json",
            "backup",
            "tank/home",
            "--destination",
            "/mnt/backup",
            "--full",
        ])
        .unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Commands::Backup(args) => {
                assert_eq!(args.filesystem, "tank/home");
                assert!(args.full);
                assert!(args.base.is_none());
            }
            _ => panic!("expected backup command"),
        }
    }

    #[test]
    fn test_base_conflicts_with_full() {
        let result = Cli::try_parse_from([
            "zsnapmgr", "backup", "tank/home", "--base", "2024-01-01", "--full",
        ]);
        assert!(result.is_err());
    }
}
