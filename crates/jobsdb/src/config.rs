//! Queue configuration.
//!
//! Every setting has a default and can be overridden from the environment
//! with `JobsDbConfig::from_env`. Unparseable values fall back to the default
//! with a warning rather than failing startup.

use std::path::PathBuf;
use std::time::Duration;

use strata_tenancy::SchedulerConfig;

use crate::backup::retry::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid table prefix '{0}': expected lowercase ascii letters, digits or '_', starting with a letter")]
    InvalidPrefix(String),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// When the current dataset is closed for writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_ds_rows: u64,
    pub max_ds_age: Duration,
    pub check_interval: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_ds_rows: 100_000,
            max_ds_age: Duration::from_secs(3600),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Process-wide archival settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupConfig {
    /// Process-wide switch; combined with the per-instance flag.
    pub enabled: bool,
    /// Archival is off when no bucket is configured.
    pub bucket: String,
    /// Tag reported with failure metrics.
    pub storage_provider: String,
    /// Path segment identifying this process in uploaded artifact paths.
    pub instance_id: String,
    pub batch_rows: usize,
    pub max_payload_bytes: u64,
    pub backoff: BackoffPolicy,
    pub check_interval: Duration,
    /// Poll interval multiplier applied when nothing is archivable.
    pub empty_sleep_multiplier: u32,
    pub scratch_dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: String::new(),
            storage_provider: "S3".to_string(),
            instance_id: "1".to_string(),
            batch_rows: 10_000,
            max_payload_bytes: 64 * 1024 * 1024,
            backoff: BackoffPolicy::default(),
            check_interval: Duration::from_secs(5),
            empty_sleep_multiplier: 6,
            scratch_dir: std::env::temp_dir().join("strata-backups"),
        }
    }
}

/// Per-queue archival settings, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackupSettings {
    pub instance_enabled: bool,
    /// Export only jobs whose latest status is `failed` or `aborted`.
    pub failed_only: bool,
    pub path_prefix: Option<String>,
}

impl BackupSettings {
    pub fn enabled() -> Self {
        Self {
            instance_enabled: true,
            ..Default::default()
        }
    }

    pub fn with_failed_only(mut self, failed_only: bool) -> Self {
        self.failed_only = failed_only;
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn is_enabled(&self, backup: &BackupConfig) -> bool {
        backup.enabled && self.instance_enabled && !backup.bucket.is_empty()
    }

    /// Path segments artifacts are uploaded under.
    pub fn upload_prefixes(&self, backup: &BackupConfig) -> Vec<String> {
        match self.path_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => {
                vec![prefix.to_string(), backup.instance_id.clone()]
            }
            _ => vec![backup.instance_id.clone()],
        }
    }
}

/// Configuration of one queue instance.
#[derive(Debug, Clone, PartialEq)]
pub struct JobsDbConfig {
    /// Table prefix and queue name, e.g. `gw` or `rt`.
    pub prefix: String,
    pub rotation: RotationConfig,
    pub backup: BackupConfig,
    pub settings: BackupSettings,
    pub scheduler: SchedulerConfig,
    /// `failed` statuses at or beyond this attempt are recorded as `aborted`.
    pub max_attempts: u32,
    /// Datasets scanned per claim, oldest first. `None` scans all.
    pub ds_limit: Option<usize>,
    /// Drop every dataset when the handle opens.
    pub clear_db: bool,
}

impl JobsDbConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            rotation: RotationConfig::default(),
            backup: BackupConfig::default(),
            settings: BackupSettings::default(),
            scheduler: SchedulerConfig::default(),
            max_attempts: 5,
            ds_limit: None,
            clear_db: false,
        }
    }

    pub fn from_env(prefix: impl Into<String>) -> Self {
        let mut config = Self::new(prefix);
        let backup_defaults = BackupConfig::default();
        let rotation_defaults = RotationConfig::default();
        let max_retry = Duration::from_secs(env_parse(
            "JOBSDB_BACKUP_MAX_RETRY_SECS",
            backup_defaults.backoff.max_elapsed_time.as_secs(),
        ));

        config.backup = BackupConfig {
            enabled: env_parse("JOBS_BACKUP_ENABLED", backup_defaults.enabled),
            bucket: env_string("JOBS_BACKUP_BUCKET", &backup_defaults.bucket),
            storage_provider: env_string(
                "JOBS_BACKUP_STORAGE_PROVIDER",
                &backup_defaults.storage_provider,
            ),
            instance_id: env_string("INSTANCE_ID", &backup_defaults.instance_id),
            batch_rows: env_parse("JOBSDB_BACKUP_BATCH_ROWS", backup_defaults.batch_rows),
            max_payload_bytes: env_parse(
                "JOBSDB_BACKUP_MAX_PAYLOAD_BYTES",
                backup_defaults.max_payload_bytes,
            ),
            backoff: backup_defaults.backoff.with_max_elapsed_time(max_retry),
            check_interval: Duration::from_secs(env_parse(
                "JOBSDB_BACKUP_CHECK_SECS",
                backup_defaults.check_interval.as_secs(),
            )),
            scratch_dir: std::env::var("JOBSDB_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(backup_defaults.scratch_dir),
            ..backup_defaults
        };
        config.rotation = RotationConfig {
            max_ds_rows: env_parse("JOBSDB_MAX_DS_ROWS", rotation_defaults.max_ds_rows),
            max_ds_age: Duration::from_secs(env_parse(
                "JOBSDB_MAX_DS_AGE_SECS",
                rotation_defaults.max_ds_age.as_secs(),
            )),
            ..rotation_defaults
        };
        config.max_attempts = env_parse("JOBSDB_MAX_ATTEMPTS", config.max_attempts);
        config.ds_limit = match env_parse("JOBSDB_DS_LIMIT", 0usize) {
            0 => None,
            limit => Some(limit),
        };
        config.scheduler = SchedulerConfig::from_env();
        config
    }

    pub fn with_settings(mut self, settings: BackupSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_backup(mut self, backup: BackupConfig) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_rotation(mut self, rotation: RotationConfig) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_ds_limit(mut self, limit: usize) -> Self {
        self.ds_limit = Some(limit);
        self
    }

    pub fn with_clear_db(mut self, clear_db: bool) -> Self {
        self.clear_db = clear_db;
        self
    }

    /// The prefix ends up inside table names, so it is restricted to a safe
    /// identifier alphabet.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_prefix = self
            .prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase())
            && self
                .prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_prefix {
            return Err(ConfigError::InvalidPrefix(self.prefix.clone()));
        }
        if self.backup.batch_rows == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_rows",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.ds_limit == Some(0) {
            return Err(ConfigError::Invalid {
                key: "ds_limit",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archival_needs_both_flags_and_a_bucket() {
        let mut backup = BackupConfig::default();
        let settings = BackupSettings::enabled();
        assert!(!settings.is_enabled(&backup));

        backup.bucket = "archive".to_string();
        assert!(settings.is_enabled(&backup));

        backup.enabled = false;
        assert!(!settings.is_enabled(&backup));

        backup.enabled = true;
        assert!(!BackupSettings::default().is_enabled(&backup));
    }

    #[test]
    fn upload_prefixes_include_instance_id() {
        let backup = BackupConfig {
            instance_id: "node-3".to_string(),
            ..Default::default()
        };

        assert_eq!(
            BackupSettings::enabled().upload_prefixes(&backup),
            vec!["node-3".to_string()]
        );
        assert_eq!(
            BackupSettings::enabled()
                .with_path_prefix("eu")
                .upload_prefixes(&backup),
            vec!["eu".to_string(), "node-3".to_string()]
        );
    }

    #[test]
    fn prefix_must_be_a_safe_identifier() {
        assert!(JobsDbConfig::new("rt").validate().is_ok());
        assert!(JobsDbConfig::new("batch_rt2").validate().is_ok());
        for bad in ["", "2rt", "rt-1", "rt\"; drop", "RT"] {
            assert_eq!(
                JobsDbConfig::new(bad).validate(),
                Err(ConfigError::InvalidPrefix(bad.to_string()))
            );
        }
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(JobsDbConfig::new("rt").with_ds_limit(0).validate().is_err());
        assert!(JobsDbConfig::new("rt").with_max_attempts(0).validate().is_err());
    }
}
