//! Restore command implementation.

use super::{format_bytes, Context};
use crate::archive::data_path_for;
use crate::manifest::BackupManifest;
use crate::restore::{self, restore_into_volume};
use anyhow::{bail, Context as _, Result};
use clap::Args;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Arguments for the restore command
#[derive(Args)]
pub struct RestoreArgs {
    /// Manifest of the backup to restore
    pub manifest: PathBuf,

    /// Key file (default: `backup.key_file`)
    #[arg(short, long)]
    pub key_file: Option<PathBuf>,

    /// Replay the stream into this filesystem with `zfs receive`
    #[arg(short, long, required_unless_present = "output", conflicts_with = "output")]
    pub filesystem: Option<String>,

    /// Write the reconstructed delta stream to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Skip the verification pass before restoring
    #[arg(long)]
    pub skip_verify: bool,
}

/// Run the restore command
pub fn run(args: RestoreArgs, ctx: &Context) -> Result<ExitCode> {
    let key = ctx.load_key(args.key_file.as_deref())?;
    let manifest = BackupManifest::load(&args.manifest)?;

    println!(
        "Restoring {}@{} (backup {})",
        manifest.filesystem, manifest.target_snapshot, manifest.backup_id
    );

    if !args.skip_verify {
        println!("Verifying archive...");
        let report = restore::verify(manifest.clone(), open_data(&args.manifest)?, &key)?;
        println!(
            "  {} chunks, {} verified",
            report.chunks,
            format_bytes(report.plaintext_bytes)
        );
    }

    let stream = restore::restore(manifest, open_data(&args.manifest)?, &key)?;

    let written = if let Some(filesystem) = &args.filesystem {
        let zfs = ctx.config.zfs_command();
        restore_into_volume(&zfs, filesystem, stream)?
    } else if let Some(output) = &args.output {
        write_stream(stream, output)?
    } else {
        bail!("either --filesystem or --output is required");
    };

    println!("Restore completed: {} of delta stream replayed", format_bytes(written));
    Ok(ExitCode::SUCCESS)
}

fn open_data(manifest_path: &Path) -> Result<BufReader<File>> {
    let data_path = data_path_for(manifest_path);
    let file = File::open(&data_path).with_context(|| format!("opening {}", data_path.display()))?;
    Ok(BufReader::new(file))
}

/// Copy the stream into a new file, recovering typed errors from the reader
fn write_stream<R: io::Read>(mut stream: restore::RestoreStream<R>, output: &Path) -> Result<u64> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .with_context(|| format!("creating {}", output.display()))?;
    let mut writer = BufWriter::new(file);

    let written = io::copy(&mut stream, &mut writer).map_err(crate::Error::from_io)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(written)
}
