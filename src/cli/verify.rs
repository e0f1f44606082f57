//! Verify command implementation.

use super::{format_bytes, Context};
use crate::archive::data_path_for;
use crate::manifest::BackupManifest;
use crate::restore;
use anyhow::{Context as _, Result};
use clap::Args;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

/// Arguments for the verify command
#[derive(Args)]
pub struct VerifyArgs {
    /// Manifest of the backup to verify
    pub manifest: PathBuf,

    /// Key file (default: `backup.key_file`)
    #[arg(short, long)]
    pub key_file: Option<PathBuf>,
}

/// Run the verify command
pub fn run(args: VerifyArgs, ctx: &Context) -> Result<ExitCode> {
    let key = ctx.load_key(args.key_file.as_deref())?;
    let manifest = BackupManifest::load(&args.manifest)?;

    let data_path = data_path_for(&args.manifest);
    let file = File::open(&data_path).with_context(|| format!("opening {}", data_path.display()))?;

    println!("Verifying {}@{}", manifest.filesystem, manifest.target_snapshot);
    match &manifest.base_snapshot {
        Some(base) => println!("  Incremental from: {}", base),
        None => println!("  Full stream"),
    }
    println!("  Created: {}", manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    match restore::verify(manifest, BufReader::new(file), &key) {
        Ok(report) => {
            println!("Backup verified successfully!");
            println!("  Chunks: {}", report.chunks);
            println!("  Delta size: {}", format_bytes(report.plaintext_bytes));
            println!("  Ciphertext checked: {}", format_bytes(report.ciphertext_bytes));
            println!("  Checksum: {}", report.aggregate_checksum);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_integrity_failure() => {
            println!("Verification FAILED: {}", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
