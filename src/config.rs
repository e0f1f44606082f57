//! TOML configuration

use crate::backup::BackupOptions;
use crate::chunk::{ChecksumAlgorithm, CompressionAlgorithm, DEFAULT_CHUNK_SIZE, DEFAULT_ZSTD_LEVEL};
use crate::logging::LogFormat;
use crate::retention::{parse_age, RetentionBucket, RetentionPolicy};
use crate::scheduler::SchedulerOptions;
use crate::snapshot::SnapshotPeriod;
use crate::volume::ZfsCommand;
use crate::{Error, Result};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub volume: VolumeConfig,
    pub retention: RetentionConfig,
    pub scheduler: SchedulerConfig,
    pub backup: BackupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Run `zfs` through `sudo`
    pub use_sudo: bool,
    pub zfs_command: String,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            use_sudo: false,
            zfs_command: "zfs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub period: SnapshotPeriod,
    pub include_unmanaged: bool,
    pub buckets: Vec<BucketConfig>,
}

/// One `[[retention.buckets]]` entry; no `max_age` means unbounded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    pub keep: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        let bucket = |max_age: Option<&str>, keep| BucketConfig {
            max_age: max_age.map(str::to_string),
            keep,
        };
        Self {
            period: SnapshotPeriod::Daily,
            include_unmanaged: false,
            buckets: vec![
                bucket(Some("24h"), 24),
                bucket(Some("7d"), 7),
                bucket(Some("4w"), 4),
                bucket(None, 12),
            ],
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> Result<RetentionPolicy> {
        let buckets = self
            .buckets
            .iter()
            .map(|b| {
                Ok(RetentionBucket {
                    max_age: b.max_age.as_deref().map(parse_age).transpose()?,
                    keep: b.keep,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        RetentionPolicy::new(buckets)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Filesystems managed by `automanage` when none are given
    pub filesystems: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub chunk_size: usize,
    pub compression: CompressionAlgorithm,
    pub zstd_level: i32,
    pub checksum: ChecksumAlgorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: CompressionAlgorithm::default(),
            zstd_level: DEFAULT_ZSTD_LEVEL,
            checksum: ChecksumAlgorithm::default(),
            destination: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

impl Config {
    /// Default location: `<config dir>/zsnapmgr/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("", "", "zsnapmgr").ok_or_else(|| Error::Configuration {
            reason: "Could not determine config directory".to_string(),
        })?;
        Ok(project_dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or the default location when `None`. A missing file
    /// yields the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Check ranges and the retention policy
    pub fn validate(&self) -> Result<RetentionPolicy> {
        self.backup_options().validate()?;
        if self.volume.zfs_command.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "volume.zfs_command is empty".to_string(),
            });
        }
        self.retention.policy()
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            chunk_size: self.backup.chunk_size,
            compression: self.backup.compression,
            zstd_level: self.backup.zstd_level,
            checksum: self.backup.checksum,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            period: self.retention.period,
            include_unmanaged: self.retention.include_unmanaged,
            dry_run: self.scheduler.dry_run,
            lock_dir: Some(self.lock_dir()),
        }
    }

    pub fn zfs_command(&self) -> ZfsCommand {
        ZfsCommand::new(self.volume.zfs_command.clone(), self.volume.use_sudo)
    }

    /// Configured lock directory, else the runtime directory, else a
    /// directory under the system temp dir
    pub fn lock_dir(&self) -> PathBuf {
        self.scheduler.lock_dir.clone().unwrap_or_else(|| {
            BaseDirs::new()
                .and_then(|dirs| dirs.runtime_dir().map(|d| d.join("zsnapmgr")))
                .unwrap_or_else(|| std::env::temp_dir().join("zsnapmgr"))
        })
    }
}
