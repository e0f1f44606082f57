//! Scheduled mode: snapshot and prune every managed filesystem.

use super::Context;
use crate::scheduler::{DestroyStatus, RunReport, SnapshotScheduler};
use anyhow::{bail, Result};
use clap::Args;
use std::process::ExitCode;
use tracing::error;

/// Arguments for the automanage command
#[derive(Args)]
pub struct AutomanageArgs {
    /// Filesystems to manage (default: `scheduler.filesystems` from the config)
    pub filesystems: Vec<String>,

    /// Manage every filesystem the volume manager reports
    #[arg(long, conflicts_with = "filesystems")]
    pub all: bool,

    /// Report what would happen without creating or destroying anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the automanage command
pub fn run(args: AutomanageArgs, ctx: &Context) -> Result<ExitCode> {
    let policy = ctx.config.validate()?;
    let zfs = ctx.config.zfs_command();

    let filesystems = if args.all {
        zfs.list_filesystems()?
    } else if !args.filesystems.is_empty() {
        args.filesystems
    } else {
        ctx.config.scheduler.filesystems.clone()
    };
    if filesystems.is_empty() {
        bail!("no filesystems given (pass them, use --all, or set scheduler.filesystems)");
    }

    let mut options = ctx.config.scheduler_options();
    options.dry_run |= args.dry_run;
    let scheduler = SnapshotScheduler::with_options(zfs, policy, options);

    let mut all_ok = true;
    for (filesystem, result) in scheduler.run_many(&filesystems) {
        match result {
            Ok(report) => {
                print_report(&report);
                all_ok &= report.is_success();
            }
            Err(e) => {
                error!("{}: {}", filesystem, e);
                println!("{}: FAILED ({})", filesystem, e);
                all_ok = false;
            }
        }
    }

    Ok(if all_ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_report(report: &RunReport) {
    let prefix = if report.dry_run { "[dry run] " } else { "" };
    let created = if report.created { "created" } else { "present" };
    println!(
        "{}{}: {}@{} {}, {} kept, {} removed",
        prefix,
        report.filesystem,
        report.filesystem,
        report.period_snapshot,
        created,
        report.retained,
        report.destroyed()
    );
    for outcome in &report.outcomes {
        match &outcome.status {
            DestroyStatus::Destroyed => println!("  destroyed {}", outcome.snapshot),
            DestroyStatus::Planned => println!("  would destroy {}", outcome.snapshot),
            DestroyStatus::Failed(e) => println!("  failed to destroy {}: {}", outcome.snapshot, e),
        }
    }
}
