//! Configuration for the presence agent.

use crate::core::leave::RejectionPolicy;
use crate::store::RetryPolicy;
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the presence agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IANA timezone used for the business day and the late cutoff
    pub timezone: String,

    /// First check-ins at or after this local time are Late
    pub late_cutoff: NaiveTime,

    /// Local time at which everyone still checked in is checked out
    pub end_of_day: NaiveTime,

    /// Observations below this confidence are ignored
    pub min_confidence: f64,

    /// Gaps longer than this count as out-of-sight time
    #[serde(with = "duration_serde")]
    pub out_of_sight_threshold: Duration,

    /// Total out-of-sight time that triggers an early check-out
    #[serde(with = "duration_serde")]
    pub long_absence_threshold: Duration,

    /// How often checked-in progress is flushed
    #[serde(with = "duration_serde")]
    pub checkpoint_interval: Duration,

    /// Pending flush jobs before new ones are deferred
    pub flush_queue_capacity: usize,

    /// Buffered sightings between the reader and the tracker
    pub sighting_queue_capacity: usize,

    /// Backoff for transient store errors
    pub retry: RetryPolicy,

    /// Which rows a leave rejection removes
    pub rejection_policy: RejectionPolicy,

    /// Same-day leave may only be requested after this local time
    pub leave_same_day_cutoff: NaiveTime,

    /// Record store connection
    pub store: StoreConfig,

    /// Path for storing session stats
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("presence-agent");

        Self {
            timezone: "UTC".to_string(),
            late_cutoff: hms(9, 30),
            end_of_day: hms(18, 0),
            min_confidence: 0.4,
            out_of_sight_threshold: Duration::from_secs(60),
            long_absence_threshold: Duration::from_secs(2 * 60 * 60),
            checkpoint_interval: Duration::from_secs(300), // 5 minutes
            flush_queue_capacity: 256,
            sighting_queue_capacity: 10_000,
            retry: RetryPolicy::default(),
            rejection_policy: RejectionPolicy::default(),
            leave_same_day_cutoff: hms(7, 0),
            store: StoreConfig::default(),
            data_path: data_dir,
        }
    }
}

fn hms(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when missing.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.tz()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("presence-agent")
            .join("config.json")
    }

    /// Where session stats are persisted.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("session_stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// The configured timezone.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }
}

/// Connection settings for the HTTP record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// API base URL, without a trailing slash
    pub base_url: String,
    /// Bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            token: None,
            timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
