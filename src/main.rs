//! zsnapmgr - ZFS snapshot retention manager with encrypted incremental backups
//!
//! Main binary entry point for the command-line interface.

use anyhow::{Context as _, Result};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use std::process::ExitCode;
use std::thread;
use tracing::{error, warn};
use zsnapmgr::cli::{self, Cli, Commands, Context};
use zsnapmgr::config::Config;
use zsnapmgr::logging;
use zsnapmgr::CancellationToken;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load_or_default(cli.config.as_deref()).context("loading configuration")?;

    let level = logging::default_level(&config.logging.level, cli.quiet, cli.verbose)?;
    let format = cli.log_format.unwrap_or(config.logging.format);
    logging::init_logging(level, format, config.logging.file.as_deref())?;

    let cancel = install_signal_watcher()?;
    let ctx = Context::new(config, cancel);

    match cli.command {
        Commands::Automanage(args) => cli::automanage::run(args, &ctx),
        Commands::Snapshots(args) => cli::snapshots::run(args, &ctx),
        Commands::Backup(args) => cli::backup::run(args, &ctx),
        Commands::Restore(args) => cli::restore::run(args, &ctx),
        Commands::Verify(args) => cli::verify::run(args, &ctx),
        Commands::Keygen(args) => cli::keygen::run(args, &ctx),
    }
}

/// Block SIGINT and SIGTERM in every thread and turn them into a
/// cancellation request on a dedicated thread. A second signal exits at once.
fn install_signal_watcher() -> Result<CancellationToken> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context("blocking termination signals")?;

    let token = CancellationToken::new();
    let watcher = token.clone();
    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            while let Ok(signal) = signals.wait() {
                if watcher.is_cancelled() {
                    std::process::exit(130);
                }
                warn!("Received {}, stopping after the current chunk", signal);
                watcher.cancel();
            }
        })
        .context("spawning signal watcher")?;

    Ok(token)
}
