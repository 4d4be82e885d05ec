//! Configuration module for the telemetry bus
//!
//! This module handles the configuration file and its sections:
//! - [`BusConfig`] - Delivery quality and simulated broker behaviour
//! - [`PublisherConfig`] - Retry policy and shutdown timeout of the queued publisher
//! - [`ProducerConfig`] - Topic, experiments and cadence of the data producer
//! - [`DashboardConfig`] - Refresh interval and history size of the live view
//! - [`LoggingConfig`] - Log filter and optional log directory
//!
//! # Config Location
//!
//! Without an explicit path, the configuration is read from the platform
//! config directory under `telemetry-bus/config.toml`:
//!
//! - **Linux**: `~/.config/telemetry-bus/`
//! - **macOS**: `~/Library/Application Support/telemetry-bus/`
//! - **Windows**: `%APPDATA%\telemetry-bus\`
//!
//! Files ending in `.toml` are parsed as TOML, anything else as JSON. Every
//! field has a default, so a partial file is valid.
//!
//! # Example
//!
//! ```ignore
//! use telemetry_bus::config::AppConfig;
//!
//! let config = AppConfig::load("producer.toml")?;
//! config.validate()?;
//! let kinds = config.producer.experiment_types()?;
//! ```

use crate::error::{Result, TelemetryError};
use crate::types::{ChannelLayout, ExperimentType, QoS, DEFAULT_TOPIC};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "telemetry-bus";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default tick interval between records in milliseconds
pub const DEFAULT_INTERVAL_MS: u64 = 250;

/// Default number of points per experiment run
pub const DEFAULT_POINTS: u32 = 20;

/// Default dashboard refresh interval in milliseconds
pub const DEFAULT_REFRESH_MS: u64 = 1000;

/// Default maximum samples retained per series
pub const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// Default log filter
pub const DEFAULT_LOG_FILTER: &str = "info,telemetry_bus=debug";

/// Default wait for a publish confirmation in milliseconds
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 5_000;

/// Default bound on draining one channel at shutdown in milliseconds
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;

/// Default number of accepted messages the in-process broker remembers
pub const DEFAULT_PUBLISH_LOG_CAPACITY: usize = 1_000;

// ==================== Config Directory ====================

/// Get the application config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Bus ====================

/// Bus connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Delivery quality for published records (0-2)
    #[serde(default)]
    pub qos: QoS,

    /// Simulated confirmation latency of the in-process broker
    #[serde(default)]
    pub latency_ms: u64,

    /// How long to wait for a publish confirmation before giving up (0 = forever)
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    /// Accepted messages the in-process broker keeps for inspection (0 = none)
    #[serde(default = "default_publish_log_capacity")]
    pub publish_log_capacity: usize,
}

fn default_confirm_timeout_ms() -> u64 {
    DEFAULT_CONFIRM_TIMEOUT_MS
}

fn default_publish_log_capacity() -> usize {
    DEFAULT_PUBLISH_LOG_CAPACITY
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            qos: QoS::default(),
            latency_ms: 0,
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT_MS,
            publish_log_capacity: DEFAULT_PUBLISH_LOG_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Confirmation timeout, `None` when waiting forever
    pub fn confirm_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.confirm_timeout_ms)
    }
}

// ==================== Publisher ====================

/// Retry policy for failed publishes
///
/// Attempt `n` (1-based) that fails waits `initial_backoff * multiplier^(n-1)`,
/// capped at `max_backoff`, before attempt `n + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per envelope, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failure
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy with `max_attempts` attempts and a fixed delay
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            initial_backoff_ms: ms,
            max_backoff_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Queued publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Upper bound on draining a channel at shutdown (0 = wait forever)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Retry policy for each envelope
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_stop_timeout_ms() -> u64 {
    DEFAULT_STOP_TIMEOUT_MS
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PublisherConfig {
    /// Shutdown timeout, `None` when waiting forever
    pub fn stop_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.stop_timeout_ms)
    }
}

// ==================== Producer ====================

/// Data producer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Base topic that experiment channels hang off
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Points per experiment run
    #[serde(default = "default_points")]
    pub points: u32,

    /// Number of times each experiment is run
    #[serde(default = "default_repeats")]
    pub repeats: u32,

    /// Delay between records in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Experiment types to run (1-5)
    #[serde(default = "default_experiments")]
    pub experiments: Vec<u8>,

    /// Channel layout
    #[serde(default)]
    pub layout: ChannelLayout,

    /// Identity tag added to every record
    #[serde(default)]
    pub producer_id: Option<String>,

    /// Fixed RNG seed for reproducible noise
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_points() -> u32 {
    DEFAULT_POINTS
}

fn default_repeats() -> u32 {
    1
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_experiments() -> Vec<u8> {
    vec![1]
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            points: DEFAULT_POINTS,
            repeats: 1,
            interval_ms: DEFAULT_INTERVAL_MS,
            experiments: default_experiments(),
            layout: ChannelLayout::default(),
            producer_id: None,
            seed: None,
        }
    }
}

impl ProducerConfig {
    /// Parse the configured experiment numbers
    pub fn experiment_types(&self) -> Result<Vec<ExperimentType>> {
        ExperimentType::parse_list(&self.experiments)
    }

    /// Tick interval as a Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Channels this producer publishes to
    pub fn channels(&self) -> Result<Vec<String>> {
        Ok(self.layout.channels(&self.topic, &self.experiment_types()?))
    }
}

// ==================== Dashboard ====================

/// Live view settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Refresh interval in milliseconds
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,

    /// Maximum samples kept per series
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

fn default_refresh_ms() -> u64 {
    DEFAULT_REFRESH_MS
}

fn default_max_samples() -> usize {
    DEFAULT_MAX_SAMPLES
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            refresh_ms: DEFAULT_REFRESH_MS,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

// ==================== Logging ====================

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive (RUST_LOG takes precedence)
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Directory for daily-rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            log_dir: None,
        }
    }
}

// ==================== App Config ====================

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Queued publisher settings
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Data producer settings
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Live view settings
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                TelemetryError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })
        } else {
            serde_json::from_str(&content).map_err(|e| {
                TelemetryError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })
        }
    }

    /// Load the config at the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config, using defaults: {}", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Save the config to disk
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TelemetryError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| TelemetryError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| TelemetryError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            TelemetryError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Reject configurations that cannot run
    ///
    /// Called before any worker thread is spawned.
    pub fn validate(&self) -> Result<()> {
        let producer = &self.producer;

        if producer.experiments.is_empty() {
            return Err(TelemetryError::Config("No experiment types selected".to_string()));
        }
        producer.experiment_types()?;

        if producer.points == 0 {
            return Err(TelemetryError::Config("Point count must be at least 1".to_string()));
        }
        if producer.topic.is_empty() || producer.topic.contains(['+', '#']) {
            return Err(TelemetryError::Config(format!(
                "Invalid topic '{}'",
                producer.topic
            )));
        }
        if self.publisher.retry.max_attempts == 0 {
            return Err(TelemetryError::Config(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }
        if self.dashboard.max_samples == 0 {
            return Err(TelemetryError::Config("max_samples must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

// ==================== Tests ====================
