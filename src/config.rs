//! Runtime configuration, read from the environment (and `.env` files).

use crate::contract::RestorePolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub audit: AuditConfig,
    pub retention: RetentionConfig,
    pub uploads: UploadConfig,
    pub restore_policy: RestorePolicy,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Maximum number of queued audit requests before new ones are dropped.
    pub queue_capacity: usize,
    /// How long the worker waits on an empty queue before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Upper bound on how long `stop()` waits for the worker to exit.
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub activity_days: i64,
    pub version_days: i64,
    pub soft_delete_days: i64,
    pub interval: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            poll_interval: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            activity_days: 30,
            version_days: 90,
            soft_delete_days: 30,
            interval: Duration::from_secs(24 * 3600),
            batch_size: 200,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 131_072_000,
            allowed_extensions: ["pdf", "docx", "doc", "txt", "rtf"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            audit: AuditConfig::default(),
            retention: RetentionConfig::default(),
            uploads: UploadConfig::default(),
            restore_policy: RestorePolicy::default(),
        }
    }
}

/// Longest accepted retention window, in days.
const MAX_RETENTION_DAYS: i64 = 36_500;
/// Longest accepted sweep interval, in hours.
const MAX_SWEEP_INTERVAL_HOURS: u64 = 24 * 366;

impl Config {
    pub fn from_env() -> Result<Self, String> {
        load_dotenv_layers();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from `lookup`, which maps a key to its raw value.
    /// Every key is optional; a present but invalid value is an error naming
    /// the key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let defaults = Config::default();
        let restore_policy = match vars.get("RESTORE_POLICY") {
            Some(v) => RestorePolicy::parse(&v)
                .ok_or_else(|| format!("invalid RESTORE_POLICY: {v}"))?,
            None => defaults.restore_policy,
        };
        let interval_hours =
            vars.u64_in_range("SWEEP_INTERVAL_HOURS", 24, 1, MAX_SWEEP_INTERVAL_HOURS)?;

        Ok(Self {
            data_dir: vars
                .get("CONTRACTS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            audit: AuditConfig {
                queue_capacity: vars.u64_in_range(
                    "AUDIT_QUEUE_CAPACITY",
                    defaults.audit.queue_capacity as u64,
                    1,
                    u32::MAX as u64,
                )? as usize,
                poll_interval: Duration::from_millis(vars.u64("AUDIT_POLL_MS", 250)?),
                stop_timeout: Duration::from_millis(vars.u64("AUDIT_STOP_TIMEOUT_MS", 5000)?),
            },
            retention: RetentionConfig {
                activity_days: vars.days("ACTIVITY_RETENTION_DAYS", defaults.retention.activity_days)?,
                version_days: vars.days("VERSION_RETENTION_DAYS", defaults.retention.version_days)?,
                soft_delete_days: vars
                    .days("SOFT_DELETE_RETENTION_DAYS", defaults.retention.soft_delete_days)?,
                interval: interval_hours
                    .checked_mul(3600)
                    .map(Duration::from_secs)
                    .ok_or_else(|| format!("invalid SWEEP_INTERVAL_HOURS: {interval_hours}"))?,
                batch_size: vars.u64_in_range(
                    "SWEEP_BATCH_SIZE",
                    defaults.retention.batch_size as u64,
                    1,
                    u32::MAX as u64,
                )? as usize,
            },
            uploads: UploadConfig {
                max_bytes: vars.u64("MAX_UPLOAD_BYTES", defaults.uploads.max_bytes)?,
                allowed_extensions: match vars.get("ALLOWED_EXTENSIONS") {
                    Some(v) => v
                        .split(',')
                        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                        .filter(|ext| !ext.is_empty())
                        .collect(),
                    None => defaults.uploads.allowed_extensions,
                },
            },
            restore_policy,
        })
    }

    pub fn contracts_db_path(&self) -> PathBuf {
        self.data_dir.join("contracts.db")
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.data_dir.join("logs.db")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

// Respects XDG_DATA_HOME, falling back to ~/.local/share.
fn default_data_dir() -> PathBuf {
    let base = env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".local").join("share")
        });
    base.join("contract-records")
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64, String> {
        match self.get(key) {
            Some(v) => v.trim().parse::<u64>().map_err(|e| format!("invalid {key}: {e}")),
            None => Ok(default),
        }
    }

    fn u64_in_range(&self, key: &str, default: u64, min: u64, max: u64) -> Result<u64, String> {
        let value = self.u64(key, default)?;
        if !(min..=max).contains(&value) {
            return Err(format!("invalid {key}: {value} is outside {min}..={max}"));
        }
        Ok(value)
    }

    // Retention windows are whole days, at least one.
    fn days(&self, key: &str, default: i64) -> Result<i64, String> {
        let value = match self.get(key) {
            Some(v) => v.trim().parse::<i64>().map_err(|e| format!("invalid {key}: {e}"))?,
            None => default,
        };
        if !(1..=MAX_RETENTION_DAYS).contains(&value) {
            return Err(format!(
                "invalid {key}: {value} is outside 1..={MAX_RETENTION_DAYS} days"
            ));
        }
        Ok(value)
    }
}

fn load_dotenv_layers() {
    for path in [".env", "../.env"] {
        let _ = dotenvy::from_path(path);
    }
}
