//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     MEDSYNC_SYNC_INTERVAL_SECS=60                                      │
//! │     MEDSYNC_CONFLICT_MODE=fields_only                                  │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/medsync/sync.toml (Linux)                                │
//! │     ~/Library/Application Support/com.medsync.medsync/sync.toml       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [cache]
//! default_ttl_secs = 3600
//! cleanup_interval_secs = 900
//!
//! [queue]
//! max_queue_size = 1000
//! max_retries = 3
//! retry_delay_ms = 1000
//!
//! [sync]
//! sync_interval_secs = 300
//! operation_timeout_ms = 10000
//! probe_timeout_ms = 5000
//! quick_retry_timeout_ms = 3000
//! batch_size = 500
//! max_concurrent_fetches = 4
//! sync_on_write = true
//!
//! [availability]
//! reprobe_interval_secs = 300
//!
//! [conflict]
//! mode = "timestamp_and_fields"   # timestamp_and_fields | fields_only | disabled
//! clock_skew_tolerance_ms = 0
//! numeric_tolerance = 0.0
//!
//! [storage]
//! database_path = "medsync.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use medsync_core::{ConflictPolicy, DetectionMode};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Cache Settings
// =============================================================================

/// Tiered cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL applied when a write does not name one.
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// Period of the expired-entry sweep.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_ttl() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    900
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            default_ttl_secs: default_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Operation queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Oldest operations are evicted beyond this length.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Retryable failures allowed before an operation is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay, doubled per attempt.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync pass behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Period of the background pass while signed in.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Time box for every remote call made by a pass.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Time box for availability probes.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Time box for the probe `force_sync` runs while offline.
    #[serde(default = "default_quick_retry_timeout")]
    pub quick_retry_timeout_ms: u64,

    /// Upper bound on writes per batch commit. The adapter's own limit
    /// applies when it is lower.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Remote reads in flight at once during a pass.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Start a background pass after each local write.
    #[serde(default = "default_true")]
    pub sync_on_write: bool,
}

fn default_sync_interval() -> u64 {
    300
}

fn default_operation_timeout() -> u64 {
    10_000
}

fn default_probe_timeout() -> u64 {
    5_000
}

fn default_quick_retry_timeout() -> u64 {
    3_000
}

fn default_batch_size() -> usize {
    500
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            sync_interval_secs: default_sync_interval(),
            operation_timeout_ms: default_operation_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            quick_retry_timeout_ms: default_quick_retry_timeout(),
            batch_size: default_batch_size(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            sync_on_write: true,
        }
    }
}

// =============================================================================
// Availability Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySettings {
    /// Period of re-probing while the remote is unreachable.
    #[serde(default = "default_reprobe_interval")]
    pub reprobe_interval_secs: u64,
}

fn default_reprobe_interval() -> u64 {
    300
}

impl Default for AvailabilitySettings {
    fn default() -> Self {
        AvailabilitySettings {
            reprobe_interval_secs: default_reprobe_interval(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Local SQLite file. Relative paths resolve against the working
    /// directory.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("medsync.db")
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: default_database_path(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub availability: AvailabilitySettings,

    /// Conflict detection policy.
    #[serde(default)]
    pub conflict: ConflictPolicy,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let positive = [
            ("cache.default_ttl_secs", self.cache.default_ttl_secs),
            ("cache.cleanup_interval_secs", self.cache.cleanup_interval_secs),
            ("queue.max_queue_size", self.queue.max_queue_size as u64),
            ("sync.sync_interval_secs", self.sync.sync_interval_secs),
            ("sync.operation_timeout_ms", self.sync.operation_timeout_ms),
            ("sync.probe_timeout_ms", self.sync.probe_timeout_ms),
            ("sync.quick_retry_timeout_ms", self.sync.quick_retry_timeout_ms),
            ("sync.batch_size", self.sync.batch_size as u64),
            ("sync.max_concurrent_fetches", self.sync.max_concurrent_fetches as u64),
            ("availability.reprobe_interval_secs", self.availability.reprobe_interval_secs),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.conflict.clock_skew_tolerance_ms < 0 {
            return Err(SyncError::InvalidConfig(
                "conflict.clock_skew_tolerance_ms must not be negative".into(),
            ));
        }

        let tolerance = self.conflict.numeric_tolerance;
        if tolerance.is_nan() || tolerance < 0.0 {
            return Err(SyncError::InvalidConfig(
                "conflict.numeric_tolerance must be a non-negative number".into(),
            ));
        }

        if self.storage.database_path.as_os_str().is_empty() {
            return Err(SyncError::InvalidConfig(
                "storage.database_path must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Applies `MEDSYNC_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparsable environment override");
                    None
                }
            }
        }

        if let Some(ttl) = parsed("MEDSYNC_DEFAULT_TTL_SECS", lookup("MEDSYNC_DEFAULT_TTL_SECS")) {
            self.cache.default_ttl_secs = ttl;
        }

        if let Some(size) = parsed("MEDSYNC_MAX_QUEUE_SIZE", lookup("MEDSYNC_MAX_QUEUE_SIZE")) {
            self.queue.max_queue_size = size;
        }

        if let Some(retries) = parsed("MEDSYNC_MAX_RETRIES", lookup("MEDSYNC_MAX_RETRIES")) {
            self.queue.max_retries = retries;
        }

        if let Some(delay) = parsed("MEDSYNC_RETRY_DELAY_MS", lookup("MEDSYNC_RETRY_DELAY_MS")) {
            self.queue.retry_delay_ms = delay;
        }

        if let Some(interval) =
            parsed("MEDSYNC_SYNC_INTERVAL_SECS", lookup("MEDSYNC_SYNC_INTERVAL_SECS"))
        {
            debug!(interval, "Overriding sync interval from environment");
            self.sync.sync_interval_secs = interval;
        }

        if let Some(mode) = lookup("MEDSYNC_CONFLICT_MODE") {
            match mode.parse::<DetectionMode>() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding conflict mode from environment");
                    self.conflict.mode = parsed;
                }
                Err(e) => warn!(error = %e, "Ignoring conflict mode from environment"),
            }
        }

        if let Some(path) = lookup("MEDSYNC_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = PathBuf::from(path);
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "medsync", "medsync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache.cleanup_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.queue.retry_delay_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.sync_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.operation_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.probe_timeout_ms)
    }

    pub fn quick_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.quick_retry_timeout_ms)
    }

    pub fn reprobe_interval(&self) -> Duration {
        Duration::from_secs(self.availability.reprobe_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert_eq!(config.queue.max_queue_size, 1000);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.operation_timeout(), Duration::from_secs(10));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.quick_retry_timeout(), Duration::from_secs(3));
        assert_eq!(config.conflict.mode, DetectionMode::TimestampAndFields);
        assert!(config.sync.sync_on_write);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        config.sync.batch_size = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        let mut config = SyncConfig::default();
        config.conflict.numeric_tolerance = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.conflict.clock_skew_tolerance_ms = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [queue]
            max_retries = 5

            [conflict]
            mode = "fields_only"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.max_queue_size, 1000);
        assert_eq!(config.conflict.mode, DetectionMode::FieldsOnly);
        assert!(config.conflict.ignored_fields.contains(&"updatedAt".to_string()));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MEDSYNC_MAX_RETRIES", "7"),
            ("MEDSYNC_SYNC_INTERVAL_SECS", "60"),
            ("MEDSYNC_CONFLICT_MODE", "disabled"),
            ("MEDSYNC_DATABASE_PATH", "/tmp/other.db"),
            ("MEDSYNC_MAX_QUEUE_SIZE", "lots"),
        ]);

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.queue.max_retries, 7);
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.conflict.mode, DetectionMode::Disabled);
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/other.db"));
        // Unparsable values are ignored
        assert_eq!(config.queue.max_queue_size, 1000);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("medsync-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("sync.toml");

        let mut config = SyncConfig::default();
        config.queue.max_retries = 9;
        config.save(Some(path.clone())).unwrap();

        let loaded: SyncConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&SyncConfig::default()).unwrap();
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[conflict]"));
        assert!(toml_str.contains("timestamp_and_fields"));
    }
}
