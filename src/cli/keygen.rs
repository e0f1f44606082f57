//! Keygen command implementation.

use super::Context;
use crate::crypto::BackupKey;
use anyhow::{Context as _, Result};
use clap::Args;
use std::path::PathBuf;
use std::process::ExitCode;

/// Arguments for the keygen command
#[derive(Args)]
pub struct KeygenArgs {
    /// Where to write the new key; an existing file is never overwritten
    pub path: PathBuf,
}

/// Run the keygen command
pub fn run(args: KeygenArgs, _ctx: &Context) -> Result<ExitCode> {
    if let Some(parent) = args.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let key = BackupKey::generate();
    key.write_key_file(&args.path)
        .with_context(|| format!("writing key to {}", args.path.display()))?;

    println!("Wrote new backup key to {}", args.path.display());
    println!("Keep a copy somewhere safe: backups cannot be restored without it.");
    Ok(ExitCode::SUCCESS)
}
