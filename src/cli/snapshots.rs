//! Snapshots command: the catalog of one filesystem with retention decisions.

use super::{format_bytes, Context};
use crate::catalog;
use crate::retention::{self, format_age};
use anyhow::Result;
use chrono::Utc;
use clap::Args;
use std::process::ExitCode;

/// Arguments for the snapshots command
#[derive(Args)]
pub struct SnapshotsArgs {
    /// Filesystem to list
    pub filesystem: String,

    /// Print decisions as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Run the snapshots command
pub fn run(args: SnapshotsArgs, ctx: &Context) -> Result<ExitCode> {
    let policy = ctx.config.validate()?;
    let zfs = ctx.config.zfs_command();

    let snapshots = catalog::load(&zfs, &args.filesystem)?;
    if snapshots.is_empty() {
        println!("No snapshots of {}", args.filesystem);
        return Ok(ExitCode::SUCCESS);
    }

    let include_unmanaged = ctx.config.retention.include_unmanaged;
    let (managed, ignored): (Vec<_>, Vec<_>) = snapshots
        .into_iter()
        .partition(|s| include_unmanaged || s.is_managed());
    let decisions = retention::evaluate(&managed, &policy, Utc::now())?;

    if args.json {
        for decision in &decisions {
            let line = serde_json::json!({
                "snapshot": decision.snapshot.full_name(),
                "created": decision.snapshot.created,
                "used_bytes": decision.snapshot.used_bytes,
                "bucket": decision.bucket,
                "sub_interval": decision.sub_interval,
                "keep": decision.keep(),
                "reason": decision.reason.to_string(),
            });
            println!("{}", line);
        }
        for snapshot in &ignored {
            println!("{}", serde_json::json!({ "snapshot": snapshot.full_name(), "ignored": true }));
        }
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<28} {:<20} {:>10} {:>8} {:>7} {:<8} {}",
        "Snapshot", "Created", "Used", "Age", "Bucket", "Action", "Reason"
    );
    println!("{}", "-".repeat(100));

    for decision in &decisions {
        let snapshot = &decision.snapshot;
        let action = if decision.keep() {
            "keep"
        } else {
            "destroy"
        };
        println!(
            "{:<28} {:<20} {:>10} {:>8} {:>7} {:<8} {}",
            snapshot.name,
            snapshot.created.format("%Y-%m-%d %H:%M:%S"),
            format_bytes(snapshot.used_bytes),
            format_age(decision.age),
            decision.bucket,
            action,
            decision.reason
        );
    }
    for snapshot in &ignored {
        println!(
            "{:<28} {:<20} {:>10} {:>8} {:>7} {:<8} {}",
            snapshot.name,
            snapshot.created.format("%Y-%m-%d %H:%M:%S"),
            format_bytes(snapshot.used_bytes),
            "-",
            "-",
            "ignore",
            "unmanaged"
        );
    }

    Ok(ExitCode::SUCCESS)
}
