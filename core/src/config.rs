//! Configuration management for Asgard Bridge

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::send::recorder::{SEND_ENTRY_EXPIRY, SEND_WAIT_TIMEOUT};
use crate::sync::batching::DEFAULT_MAX_REQUEST_IDS;
use crate::sync::limits::{SyncLimits, FORCE_MINIMUM_SPEC_ENV, MEGABYTE};
use crate::sync::stages::RetryPolicy;

/// Bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Sync settings
    pub sync: SyncConfig,
    /// Send settings
    pub send: SendConfig,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application name
    pub name: String,
    /// Application version
    pub version: String,
    /// Debug mode
    pub debug: bool,
    /// Log level
    pub log_level: String,
    /// Configuration directory
    pub config_dir: PathBuf,
}

/// Sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Parallel message and attachment downloads
    pub max_parallel_downloads: usize,
    /// Workers building downloaded messages
    pub build_workers: usize,
    /// Pause between rate-limit retry rounds (milliseconds)
    pub retry_cooldown_ms: u64,
    /// Retry rounds before giving up on rate-limited messages
    pub max_retry_rounds: Option<u32>,
    /// Bytes of built messages sent downstream at once
    pub update_chunk_size: usize,
    /// Minimum time between two progress events (milliseconds)
    pub progress_interval_ms: u64,
    /// Memory the sync may use (MB)
    pub max_sync_memory_mb: u64,
    /// Maximum message IDs per download request
    pub max_request_ids: usize,
}

/// Send configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// Lifetime of a send record (seconds)
    pub entry_expiry_secs: u64,
    /// How long a duplicate send waits for the first one (seconds)
    pub wait_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: crate::APP_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            debug: false,
            log_level: "info".to_string(),
            config_dir: PathBuf::from(".config").join(crate::CONFIG_DIR_NAME),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: 32,
            build_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            retry_cooldown_ms: 20_000,
            max_retry_rounds: None,
            update_chunk_size: 32 * MEGABYTE as usize,
            progress_interval_ms: 1_000,
            max_sync_memory_mb: 2_048,
            max_request_ids: DEFAULT_MAX_REQUEST_IDS,
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            entry_expiry_secs: SEND_ENTRY_EXPIRY.as_secs(),
            wait_timeout_secs: SEND_WAIT_TIMEOUT.as_secs(),
        }
    }
}

impl SyncConfig {
    /// Retry policy for rate-limited downloads
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.retry_cooldown_ms), self.max_retry_rounds)
    }

    /// Minimum time between two progress events
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Sync limits on a machine with `total_memory` bytes.
    ///
    /// Setting `ASGARD_BRIDGE_SYNC_FORCE_MINIMUM_SPEC` forces the smallest
    /// footprint.
    pub fn limits(&self, total_memory: u64) -> SyncLimits {
        let force_minimum = std::env::var_os(FORCE_MINIMUM_SPEC_ENV).is_some();
        SyncLimits::new(self.max_sync_memory_mb * MEGABYTE, total_memory, force_minimum)
            .with_parallel_downloads(self.max_parallel_downloads)
    }
}

impl SendConfig {
    /// Lifetime of a send record
    pub fn entry_expiry(&self) -> Duration {
        Duration::from_secs(self.entry_expiry_secs)
    }

    /// How long a duplicate send waits
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

fn env_flag(value: Option<String>) -> Option<bool> {
    value.map(|value| value == "1" || value.to_lowercase() == "true")
}

fn env_parse<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|value| value.parse().ok())
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: &Path) -> BridgeResult<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &Path) -> BridgeResult<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Self {
        Self::load_from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from `ASGARD_BRIDGE_*` variables resolved by `lookup`
    pub fn load_from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(debug) = env_flag(lookup("ASGARD_BRIDGE_DEBUG")) {
            config.app.debug = debug;
        }

        if let Some(log_level) = lookup("ASGARD_BRIDGE_LOG_LEVEL") {
            config.app.log_level = log_level;
        }

        if let Some(config_dir) = lookup("ASGARD_BRIDGE_CONFIG_DIR") {
            config.app.config_dir = PathBuf::from(config_dir);
        }

        if let Some(parallel) = env_parse(lookup("ASGARD_BRIDGE_MAX_PARALLEL_DOWNLOADS")) {
            config.sync.max_parallel_downloads = parallel;
        }

        if let Some(workers) = env_parse(lookup("ASGARD_BRIDGE_BUILD_WORKERS")) {
            config.sync.build_workers = workers;
        }

        if let Some(cooldown) = env_parse(lookup("ASGARD_BRIDGE_RETRY_COOLDOWN_MS")) {
            config.sync.retry_cooldown_ms = cooldown;
        }

        if let Some(rounds) = env_parse(lookup("ASGARD_BRIDGE_MAX_RETRY_ROUNDS")) {
            config.sync.max_retry_rounds = Some(rounds);
        }

        if let Some(memory) = env_parse(lookup("ASGARD_BRIDGE_MAX_SYNC_MEMORY_MB")) {
            config.sync.max_sync_memory_mb = memory;
        }

        if let Some(expiry) = env_parse(lookup("ASGARD_BRIDGE_SEND_ENTRY_EXPIRY_SECS")) {
            config.send.entry_expiry_secs = expiry;
        }

        if let Some(timeout) = env_parse(lookup("ASGARD_BRIDGE_SEND_WAIT_TIMEOUT_SECS")) {
            config.send.wait_timeout_secs = timeout;
        }

        config
    }

    /// Get the configuration file path
    pub fn config_file_path(&self) -> PathBuf {
        self.app.config_dir.join("config.toml")
    }

    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        if self.sync.max_parallel_downloads == 0 {
            return Err(BridgeError::config("Parallel downloads cannot be zero"));
        }

        if self.sync.build_workers == 0 {
            return Err(BridgeError::config("Build workers cannot be zero"));
        }

        if self.sync.update_chunk_size == 0 {
            return Err(BridgeError::config("Update chunk size cannot be zero"));
        }

        if self.sync.max_request_ids == 0 {
            return Err(BridgeError::config("Download request size cannot be zero"));
        }

        if self.send.entry_expiry_secs == 0 {
            return Err(BridgeError::config("Send entry expiry cannot be zero"));
        }

        Ok(())
    }
}
