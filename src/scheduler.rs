//! Snapshot upkeep: take the period's snapshot, then prune by policy.

use crate::catalog;
use crate::lock::FilesystemLock;
use crate::retention::{self, RetentionPolicy};
use crate::snapshot::{self, Snapshot, SnapshotPeriod};
use crate::volume::VolumeBinding;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info, span, warn, Level};

/// Knobs for a scheduler run
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// How often a managed snapshot is taken
    pub period: SnapshotPeriod,
    /// Let retention destroy snapshots that do not follow the naming convention
    pub include_unmanaged: bool,
    /// Compute the report without touching the volume
    pub dry_run: bool,
    /// Directory for per-filesystem lock files; `None` skips locking
    pub lock_dir: Option<PathBuf>,
}

/// What happened to one snapshot selected for destruction
#[derive(Debug)]
pub enum DestroyStatus {
    Destroyed,
    /// Dry run: would have been destroyed
    Planned,
    Failed(Error),
}

#[derive(Debug)]
pub struct DestroyOutcome {
    pub snapshot: Snapshot,
    pub status: DestroyStatus,
}

/// Result of one scheduler run on one filesystem
#[derive(Debug)]
pub struct RunReport {
    pub filesystem: String,
    /// Name of the snapshot standing for the current period
    pub period_snapshot: String,
    /// Whether this run created (or, dry, would create) the period snapshot
    pub created: bool,
    pub dry_run: bool,
    /// Number of snapshots the policy keeps
    pub retained: usize,
    pub outcomes: Vec<DestroyOutcome>,
}

impl RunReport {
    /// True when no destruction failed
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DestroyOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, DestroyStatus::Failed(_)))
    }

    pub fn destroyed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, DestroyStatus::Destroyed | DestroyStatus::Planned))
            .count()
    }
}

/// Drives snapshot creation and retention for filesystems on one binding
pub struct SnapshotScheduler<B> {
    binding: B,
    policy: RetentionPolicy,
    options: SchedulerOptions,
}

impl<B: VolumeBinding> SnapshotScheduler<B> {
    pub fn new(binding: B, policy: RetentionPolicy) -> Self {
        Self::with_options(binding, policy, SchedulerOptions::default())
    }

    pub fn with_options(binding: B, policy: RetentionPolicy, options: SchedulerOptions) -> Self {
        Self {
            binding,
            policy,
            options,
        }
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Run for `filesystem` at the current time
    pub fn run(&self, filesystem: &str) -> Result<RunReport> {
        self.run_at(filesystem, Utc::now())
    }

    /// Run for `filesystem` as if the time were `now`.
    ///
    /// Policy and catalog errors abort before anything is mutated. Failing
    /// to create the period snapshot aborts the run. Destruction failures are
    /// recorded per snapshot and never stop the remaining destructions.
    pub fn run_at(&self, filesystem: &str, now: DateTime<Utc>) -> Result<RunReport> {
        let span = span!(Level::INFO, "scheduler_run", filesystem = %filesystem);
        let _enter = span.enter();

        self.policy.validate()?;
        let _lock = match &self.options.lock_dir {
            Some(dir) => Some(FilesystemLock::acquire(dir, filesystem)?),
            None => None,
        };

        let dry_run = self.options.dry_run;
        let mut snapshots = catalog::load(&self.binding, filesystem)?;

        let period_snapshot = snapshot::period_name(now, self.options.period);
        let existing = snapshots
            .iter()
            .rev()
            .find(|s| snapshot::covers_period(s, now, self.options.period));

        let (period_snapshot, created) = match existing {
            Some(existing) => {
                debug!("Period already covered by {}", existing.full_name());
                (existing.name.clone(), false)
            }
            None if dry_run => {
                info!("Would create {}@{}", filesystem, period_snapshot);
                snapshots.push(Snapshot {
                    filesystem: filesystem.to_string(),
                    name: period_snapshot.clone(),
                    created: now,
                    used_bytes: 0,
                });
                (period_snapshot, true)
            }
            None => {
                self.binding
                    .create_snapshot(filesystem, &period_snapshot)
                    .map_err(|source| Error::SnapshotCreateFailed {
                        snapshot: format!("{}@{}", filesystem, period_snapshot),
                        source,
                    })?;
                info!("Created {}@{}", filesystem, period_snapshot);
                snapshots = catalog::load(&self.binding, filesystem)?;
                (period_snapshot, true)
            }
        };

        let candidates: Vec<Snapshot> = if self.options.include_unmanaged {
            snapshots
        } else {
            snapshots.into_iter().filter(Snapshot::is_managed).collect()
        };
        let doomed = retention::select_for_destruction(&candidates, &self.policy, now)?;
        let retained = candidates.len() - doomed.len();
        info!(
            "Retention keeps {} of {} snapshots, destroying {}",
            retained,
            candidates.len(),
            doomed.len()
        );

        let outcomes = doomed
            .into_iter()
            .map(|snapshot| {
                let status = if dry_run {
                    info!("Would destroy {}", snapshot.full_name());
                    DestroyStatus::Planned
                } else {
                    match self.binding.destroy_snapshot(filesystem, &snapshot.name) {
                        Ok(()) => {
                            info!("Destroyed {}", snapshot.full_name());
                            DestroyStatus::Destroyed
                        }
                        Err(source) => {
                            warn!("Failed to destroy {}: {}", snapshot.full_name(), source);
                            DestroyStatus::Failed(Error::SnapshotDestroyFailed {
                                snapshot: snapshot.full_name(),
                                source,
                            })
                        }
                    }
                };
                DestroyOutcome { snapshot, status }
            })
            .collect();

        Ok(RunReport {
            filesystem: filesystem.to_string(),
            period_snapshot,
            created,
            dry_run,
            retained,
            outcomes,
        })
    }

    /// Run for several filesystems in parallel, one result per filesystem in
    /// input order
    pub fn run_many(&self, filesystems: &[String]) -> Vec<(String, Result<RunReport>)> {
        let now = Utc::now();
        filesystems
            .par_iter()
            .map(|fs| (fs.clone(), self.run_at(fs, now)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionBucket;
    use crate::volume::MemoryVolume;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn seed_daily(vol: &MemoryVolume, fs: &str, days: i64) {
        vol.add_filesystem(fs);
        for d in 1..=days {
            let at = now() - Duration::days(d);
            vol.add_snapshot(fs, &snapshot::period_name(at, SnapshotPeriod::Daily), at, 1024);
        }
    }

    fn weekly_policy() -> RetentionPolicy {
        RetentionPolicy::new(vec![RetentionBucket::new(Duration::days(7), 7), RetentionBucket::unbounded(1)])
            .unwrap()
    }

    #[test]
    fn test_creates_period_snapshot_once() -> Result<()> {
        let vol = MemoryVolume::new();
        vol.add_filesystem("tank");
        vol.set_clock(now());
        let scheduler = SnapshotScheduler::new(&vol, RetentionPolicy::default());

        let first = scheduler.run_at("tank", now())?;
        assert!(first.created);
        assert!(first.is_success());

        let second = scheduler.run_at("tank", now())?;
        assert!(!second.created);
        assert_eq!(second.period_snapshot, first.period_snapshot);
        assert_eq!(vol.snapshot_names("tank").len(), 1);
        Ok(())
    }

    #[test]
    fn test_prunes_and_keeps_unmanaged() -> Result<()> {
        let vol = MemoryVolume::new();
        seed_daily(&vol, "tank", 30);
        vol.add_snapshot("tank", "before-upgrade", now() - Duration::days(60), 1);
        vol.set_clock(now());

        let scheduler = SnapshotScheduler::new(&vol, weekly_policy());
        let report = scheduler.run_at("tank", now())?;

        assert!(report.is_success());
        assert!(report.destroyed() > 0);
        let names = vol.snapshot_names("tank");
        assert!(names.contains(&"before-upgrade".to_string()));
        assert!(names.contains(&report.period_snapshot));
        Ok(())
    }

    #[test]
    fn test_destroy_failure_is_isolated() -> Result<()> {
        let vol = MemoryVolume::new();
        seed_daily(&vol, "tank", 20);
        vol.set_clock(now());
        let stuck = snapshot::period_name(now() - Duration::days(20), SnapshotPeriod::Daily);
        vol.fail_destroy_of("tank", &stuck);

        let scheduler = SnapshotScheduler::new(&vol, weekly_policy());
        let report = scheduler.run_at("tank", now())?;

        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert!(report.destroyed() > 1);
        assert!(vol.snapshot_names("tank").contains(&stuck));
        Ok(())
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let vol = MemoryVolume::new();
        seed_daily(&vol, "tank", 20);
        vol.fail_create_on("tank");
        let before = vol.snapshot_names("tank");

        let scheduler = SnapshotScheduler::new(&vol, weekly_policy());
        let err = scheduler.run_at("tank", now()).unwrap_err();

        assert!(matches!(err, Error::SnapshotCreateFailed { .. }));
        assert_eq!(vol.snapshot_names("tank"), before);
    }

    #[test]
    fn test_dry_run_mutates_nothing() -> Result<()> {
        let vol = MemoryVolume::new();
        seed_daily(&vol, "tank", 20);
        let before = vol.snapshot_names("tank");

        let options = SchedulerOptions {
            dry_run: true,
            ..Default::default()
        };
        let scheduler = SnapshotScheduler::with_options(&vol, weekly_policy(), options);
        let report = scheduler.run_at("tank", now())?;

        assert!(report.created);
        assert!(report.destroyed() > 0);
        assert!(report.outcomes.iter().all(|o| matches!(o.status, DestroyStatus::Planned)));
        assert_eq!(vol.snapshot_names("tank"), before);
        Ok(())
    }

    #[test]
    fn test_locked_filesystem_is_busy() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let vol = MemoryVolume::new();
        vol.add_filesystem("tank");
        let _held = FilesystemLock::acquire(temp_dir.path(), "tank")?;

        let options = SchedulerOptions {
            lock_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let scheduler = SnapshotScheduler::with_options(&vol, RetentionPolicy::default(), options);
        assert!(matches!(
            scheduler.run_at("tank", now()),
            Err(Error::FilesystemBusy { .. })
        ));
        assert!(vol.snapshot_names("tank").is_empty());
        Ok(())
    }

    #[test]
    fn test_run_many_reports_each_filesystem() {
        let vol = MemoryVolume::new();
        vol.add_filesystem("tank/a");
        vol.add_filesystem("tank/b");
        let scheduler = SnapshotScheduler::new(&vol, RetentionPolicy::default());

        let filesystems = vec!["tank/a".to_string(), "tank/missing".to_string(), "tank/b".to_string()];
        let results = scheduler.run_many(&filesystems);

        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(Error::CatalogUnavailable { .. })));
        assert!(results[2].1.is_ok());
    }
}
