//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration for the forwarder binary.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Root directory for the database, media and logs.
    pub data_dir: PathBuf,
    /// SQLite (libSQL) database file.
    pub db_path: PathBuf,
    /// Directory for transient attachment downloads.
    pub media_dir: PathBuf,
    /// Optional JSON file with accounts and rules to upsert on startup.
    pub rules_file: Option<PathBuf>,
    /// Optional directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
    /// Per-request timeout for platform HTTP calls.
    pub http_timeout: Duration,
    /// How long shutdown waits for in-flight dispatch tasks.
    pub drain_timeout: Duration,
    /// Interval between stats summary log lines. Zero disables it.
    pub stats_interval: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("forward.db"),
            media_dir: data_dir.join("media"),
            data_dir,
            rules_file: None,
            log_dir: None,
            http_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(300),
        }
    }
}

impl ForwardConfig {
    /// Build configuration from `TG_FORWARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (env in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("TG_FORWARD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let db_path = lookup("TG_FORWARD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("forward.db"));

        let media_dir = lookup("TG_FORWARD_MEDIA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("media"));

        Ok(Self {
            db_path,
            media_dir,
            rules_file: lookup("TG_FORWARD_RULES_FILE").map(PathBuf::from),
            log_dir: lookup("TG_FORWARD_LOG_DIR").map(PathBuf::from),
            http_timeout: secs(&lookup, "TG_FORWARD_HTTP_TIMEOUT_SECS", 60)?,
            drain_timeout: secs(&lookup, "TG_FORWARD_DRAIN_SECS", 30)?,
            stats_interval: secs(&lookup, "TG_FORWARD_STATS_INTERVAL_SECS", 300)?,
            data_dir,
        })
    }
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected whole seconds, got {raw:?}: {e}"),
            }),
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".tg_forward")
}
