//! Age-bucketed snapshot retention.
//!
//! A [`RetentionPolicy`] is an ordered list of buckets, each covering a
//! contiguous range of snapshot ages and carrying a target count. Buckets
//! start where the previous one ends, so together they cover `[0, ∞)`; when
//! the last bucket has a finite bound an implicit bucket with the same count
//! takes everything older.
//!
//! When a bucket holds more snapshots than its target count, its age range is
//! cut into `keep` equal sub-intervals and only the newest snapshot of each
//! sub-interval survives. For an unbounded bucket the range ends at the age of
//! the oldest snapshot it holds. The newest snapshot overall always survives.
//!
//! Evaluation is pure: no I/O, and the same inputs always give the same
//! decisions.

use crate::snapshot::Snapshot;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// One age range of a retention policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionBucket {
    /// Exclusive upper bound on snapshot age; `None` means unbounded
    pub max_age: Option<Duration>,
    /// Target number of snapshots to retain in this range
    pub keep: u32,
}

impl RetentionBucket {
    pub fn new(max_age: Duration, keep: u32) -> Self {
        Self {
            max_age: Some(max_age),
            keep,
        }
    }

    pub fn unbounded(keep: u32) -> Self {
        Self { max_age: None, keep }
    }
}

impl fmt::Display for RetentionBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_age {
            Some(age) => write!(f, "keep {} up to {}", self.keep, format_age(age)),
            None => write!(f, "keep {} beyond", self.keep),
        }
    }
}

/// Ordered set of contiguous age buckets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    buckets: Vec<RetentionBucket>,
}

impl Default for RetentionPolicy {
    /// Hourly for a day, daily for a week, weekly for a month, then monthly-ish
    fn default() -> Self {
        Self {
            buckets: vec![
                RetentionBucket::new(Duration::hours(24), 24),
                RetentionBucket::new(Duration::days(7), 7),
                RetentionBucket::new(Duration::weeks(4), 4),
                RetentionBucket::unbounded(12),
            ],
        }
    }
}

impl RetentionPolicy {
    /// Build a policy, rejecting bucket lists that do not tile `[0, ∞)`
    pub fn new(buckets: Vec<RetentionBucket>) -> Result<Self> {
        let policy = Self { buckets };
        policy.validate()?;
        Ok(policy)
    }

    pub fn buckets(&self) -> &[RetentionBucket] {
        &self.buckets
    }

    /// Check that the buckets are non-empty, strictly increasing and that
    /// only the last one is unbounded
    pub fn validate(&self) -> Result<()> {
        if self.buckets.is_empty() {
            return Err(Error::InvalidPolicy {
                reason: "policy has no buckets".to_string(),
            });
        }

        let mut previous = Duration::zero();
        for (i, bucket) in self.buckets.iter().enumerate() {
            match bucket.max_age {
                Some(age) if age <= previous => {
                    return Err(Error::InvalidPolicy {
                        reason: format!(
                            "bucket {} ends at {} which is not after the previous bound {}",
                            i,
                            format_age(age),
                            format_age(previous)
                        ),
                    });
                }
                Some(age) => previous = age,
                None if i + 1 != self.buckets.len() => {
                    return Err(Error::InvalidPolicy {
                        reason: format!("unbounded bucket {} must be the last one", i),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Buckets with explicit lower bounds, including the implicit trailing one
    fn ranges(&self) -> Vec<Range> {
        let mut ranges = Vec::with_capacity(self.buckets.len() + 1);
        let mut lower = Duration::zero();
        for bucket in &self.buckets {
            ranges.push(Range {
                lower,
                upper: bucket.max_age,
                keep: bucket.keep,
            });
            if let Some(upper) = bucket.max_age {
                lower = upper;
            }
        }

        if let Some(last) = self.buckets.last() {
            if last.max_age.is_some() {
                ranges.push(Range {
                    lower,
                    upper: None,
                    keep: last.keep,
                });
            }
        }
        ranges
    }
}

#[derive(Debug, Clone, Copy)]
struct Range {
    lower: Duration,
    upper: Option<Duration>,
    keep: u32,
}

impl Range {
    fn contains(&self, age: Duration) -> bool {
        self.upper.map_or(true, |upper| age < upper)
    }
}

/// Why a snapshot is kept or destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// The newest snapshot overall
    Newest,
    /// Its bucket holds no more than the target count
    WithinTarget,
    /// Newest snapshot of its sub-interval
    NewestInSubInterval,
    /// A newer snapshot occupies the same sub-interval
    Superseded,
    /// Its bucket has a target count of zero
    BucketKeepsNone,
}

impl DecisionReason {
    pub fn keeps(self) -> bool {
        matches!(
            self,
            DecisionReason::Newest | DecisionReason::WithinTarget | DecisionReason::NewestInSubInterval
        )
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DecisionReason::Newest => "newest",
            DecisionReason::WithinTarget => "within target",
            DecisionReason::NewestInSubInterval => "newest in sub-interval",
            DecisionReason::Superseded => "superseded in sub-interval",
            DecisionReason::BucketKeepsNone => "bucket keeps none",
        };
        f.write_str(text)
    }
}

/// The outcome for one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionDecision {
    pub snapshot: Snapshot,
    /// Age relative to the evaluation time, clamped at zero
    pub age: Duration,
    /// Index of the bucket; equal to the policy length for the implicit one
    pub bucket: usize,
    /// Sub-interval within the bucket, when the bucket was over its target
    pub sub_interval: Option<u32>,
    pub reason: DecisionReason,
}

impl RetentionDecision {
    pub fn keep(&self) -> bool {
        self.reason.keeps()
    }
}

/// Decide the fate of every snapshot, returned oldest first
pub fn evaluate(
    snapshots: &[Snapshot],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<RetentionDecision>> {
    policy.validate()?;

    let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
    ordered.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));

    let ranges = policy.ranges();
    let mut decisions: Vec<RetentionDecision> = ordered
        .iter()
        .map(|snapshot| {
            let age = (now - snapshot.created).max(Duration::zero());
            let bucket = ranges
                .iter()
                .position(|range| range.contains(age))
                .unwrap_or(ranges.len() - 1);
            RetentionDecision {
                snapshot: (*snapshot).clone(),
                age,
                bucket,
                sub_interval: None,
                reason: DecisionReason::WithinTarget,
            }
        })
        .collect();

    for (index, range) in ranges.iter().enumerate() {
        // Oldest first, so the newest member is last
        let members: Vec<usize> = (0..decisions.len())
            .filter(|&i| decisions[i].bucket == index)
            .collect();
        if members.len() <= range.keep as usize && range.keep > 0 {
            continue;
        }
        if range.keep == 0 {
            for &i in &members {
                decisions[i].reason = DecisionReason::BucketKeepsNone;
            }
            continue;
        }

        let upper = match range.upper {
            Some(upper) => upper,
            None => members
                .iter()
                .map(|&i| decisions[i].age)
                .max()
                .unwrap_or(range.lower),
        };
        let width = (upper - range.lower).num_milliseconds();

        let mut claimed = vec![false; range.keep as usize];
        for &i in members.iter().rev() {
            let offset = (decisions[i].age - range.lower).num_milliseconds().max(0);
            let slot = if width <= 0 {
                0
            } else {
                let slot = (offset as i128 * range.keep as i128) / width as i128;
                slot.min(range.keep as i128 - 1) as usize
            };

            decisions[i].sub_interval = Some(slot as u32);
            decisions[i].reason = if claimed[slot] {
                DecisionReason::Superseded
            } else {
                claimed[slot] = true;
                DecisionReason::NewestInSubInterval
            };
        }
    }

    if let Some(newest) = decisions.last_mut() {
        newest.reason = DecisionReason::Newest;
    }

    Ok(decisions)
}

/// Snapshots the policy says to destroy, oldest first.
///
/// Never contains the newest snapshot. An empty or single-element input
/// always yields an empty set.
pub fn select_for_destruction(
    snapshots: &[Snapshot],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<Snapshot>> {
    Ok(evaluate(snapshots, policy, now)?
        .into_iter()
        .filter(|decision| !decision.keep())
        .map(|decision| decision.snapshot)
        .collect())
}

/// Parse an age such as `90m`, `24h`, `7d`, `4w` or `1y` (365 days)
pub fn parse_age(text: &str) -> Result<Duration> {
    let text = text.trim();
    let invalid = || Error::InvalidPolicy {
        reason: format!("invalid age '{}': expected a number followed by m, h, d, w or y", text),
    };

    let split = text.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (number, unit) = text.split_at(split);
    let value: i64 = number.parse().map_err(|_| invalid())?;

    let age = match unit {
        "m" => Duration::try_minutes(value),
        "h" => Duration::try_hours(value),
        "d" => Duration::try_days(value),
        "w" => Duration::try_weeks(value),
        "y" => value.checked_mul(365).and_then(Duration::try_days),
        _ => None,
    }
    .ok_or_else(invalid)?;

    if age <= Duration::zero() {
        return Err(invalid());
    }
    Ok(age)
}

/// Render an age in the largest unit that divides it exactly
pub fn format_age(age: Duration) -> String {
    let minutes = age.num_minutes();
    if minutes == 0 {
        return format!("{}s", age.num_seconds());
    }
    for (unit, size) in [("y", 365 * 24 * 60), ("w", 7 * 24 * 60), ("d", 24 * 60), ("h", 60)] {
        if minutes % size == 0 {
            return format!("{}{}", minutes / size, unit);
        }
    }
    format!("{}m", minutes)
}
