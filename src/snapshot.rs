//! Snapshot model and the naming convention for managed snapshots

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const DAILY_FORMAT: &str = "%Y-%m-%d";
const HOURLY_FORMAT: &str = "%Y-%m-%d-%H00";

/// A point-in-time, immutable state of one filesystem
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    /// Filesystem (dataset) the snapshot belongs to
    pub filesystem: String,
    /// Snapshot name, unique within the filesystem
    pub name: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Approximate space used only by this snapshot, in bytes
    pub used_bytes: u64,
}

impl Snapshot {
    /// `filesystem@name`
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.filesystem, self.name)
    }

    /// Whether the name follows the managed naming convention
    pub fn is_managed(&self) -> bool {
        parse_managed_name(&self.name).is_some()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.filesystem, self.name)
    }
}

/// How often the scheduler takes a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPeriod {
    #[default]
    Daily,
    Hourly,
}

impl SnapshotPeriod {
    fn format(self) -> &'static str {
        match self {
            SnapshotPeriod::Daily => DAILY_FORMAT,
            SnapshotPeriod::Hourly => HOURLY_FORMAT,
        }
    }

    /// Local-time start of the period containing `now`
    pub fn start_of(self, now: DateTime<Utc>) -> NaiveDateTime {
        let local = now.with_timezone(&Local).naive_local();
        match self {
            SnapshotPeriod::Daily => local.date().and_hms_opt(0, 0, 0).unwrap_or(local),
            SnapshotPeriod::Hourly => local.date().and_hms_opt(local.hour(), 0, 0).unwrap_or(local),
        }
    }
}

impl fmt::Display for SnapshotPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotPeriod::Daily => write!(f, "daily"),
            SnapshotPeriod::Hourly => write!(f, "hourly"),
        }
    }
}

/// Name of the managed snapshot for the period containing `now`
pub fn period_name(now: DateTime<Utc>, period: SnapshotPeriod) -> String {
    period.start_of(now).format(period.format()).to_string()
}

/// Parse a managed snapshot name back into the local time it stands for
pub fn parse_managed_name(name: &str) -> Option<DateTime<Utc>> {
    let naive = parse_hourly(name).or_else(|| {
        NaiveDate::parse_from_str(name, DAILY_FORMAT)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

// `%H00` carries no minute field, so chrono cannot parse it back on its own.
fn parse_hourly(name: &str) -> Option<NaiveDateTime> {
    let (date, hour) = name.rsplit_once('-')?;
    if hour.len() != 4 || !hour.ends_with("00") {
        return None;
    }
    let hour: u32 = hour[..2].parse().ok()?;
    NaiveDate::parse_from_str(date, DAILY_FORMAT).ok()?.and_hms_opt(hour, 0, 0)
}

/// Whether `snapshot` already covers the period containing `now`
pub fn covers_period(snapshot: &Snapshot, now: DateTime<Utc>, period: SnapshotPeriod) -> bool {
    if snapshot.name == period_name(now, period) {
        return true;
    }
    snapshot.is_managed() && period.start_of(snapshot.created) == period.start_of(now)
}
