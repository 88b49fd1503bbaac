//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - IngestConfig: where sensors connect and how long a peer may stall.
//!     - StoreConfig: rolling window size and the inconsistent-reading policy.
//!     - AlertConfig: the status threshold.
//!     - SnapshotConfig: how often the presentation view is refreshed.
//!     - ApiConfig: the read-only json api.
//!     - LoggingConfig: default log filter.
//!
//! every section has defaults, so an empty file is a valid config.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::IngestError;
use crate::evaluator::{AlertPolicy, DEFAULT_ALERT_THRESHOLD};
use crate::store::DEFAULT_WINDOW_CAPACITY;

/// env var that points at an explicit config file
pub const CONFIG_ENV: &str = "TELEMETRY_HUB_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    pub ingest: IngestConfig,
    pub store: StoreConfig,
    pub alert: AlertConfig,
    pub snapshot: SnapshotConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub bind_address: String,
    /// requests waiting for the ingestion worker before connections stop reading
    pub queue_depth: usize,
    /// per-connection idle bound for receiving a request or sending a reply; 0 disables
    pub request_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub prefix_fallback: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5555".to_string(),
            queue_depth: 64,
            request_timeout_ms: 30_000,
            max_frame_bytes: 64 * 1024,
            prefix_fallback: true,
        }
    }
}

impl IngestConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub window_capacity: usize,
    pub exclude_inconsistent: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            exclude_inconsistent: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    pub threshold_percent: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_ALERT_THRESHOLD,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SnapshotConfig {
    pub interval_ms: u64,
    /// log a one-line summary of every snapshot at debug
    pub log_summary: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            log_summary: true,
        }
    }
}

impl SnapshotConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8050".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// where the active config came from, reported once logging is up
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults { rejected: Vec<(PathBuf, String)> },
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: HubConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> (Self, ConfigSource) {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("hub.toml"));
        paths.push(PathBuf::from("..").join("config").join("hub.toml"));

        let mut rejected = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load(&path) {
                Ok(config) => return (config, ConfigSource::File(path)),
                Err(e) => rejected.push((path, e.to_string())),
            }
        }

        (Self::default(), ConfigSource::Defaults { rejected })
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        let invalid = |msg: &str| Err(IngestError::Config(msg.to_string()));

        if self.store.window_capacity == 0 {
            return invalid("store.window_capacity must be at least 1");
        }
        if self.ingest.queue_depth == 0 {
            return invalid("ingest.queue_depth must be at least 1");
        }
        if self.ingest.max_frame_bytes == 0 {
            return invalid("ingest.max_frame_bytes must be at least 1");
        }
        if self.snapshot.interval_ms == 0 {
            return invalid("snapshot.interval_ms must be at least 1");
        }
        if !self.alert.threshold_percent.is_finite() {
            return invalid("alert.threshold_percent must be a finite number");
        }
        Ok(())
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            threshold_percent: self.alert.threshold_percent,
            prefix_fallback: self.ingest.prefix_fallback,
            exclude_inconsistent: self.store.exclude_inconsistent,
        }
    }

    /// Log configuration summary
    pub fn log_summary(&self, source: &ConfigSource) {
        match source {
            ConfigSource::File(path) => tracing::info!(path = %path.display(), "config loaded"),
            ConfigSource::Defaults { rejected } => {
                for (path, error) in rejected {
                    tracing::warn!(path = %path.display(), %error, "config file ignored");
                }
                tracing::warn!("no usable config file found, using defaults");
            }
        }
        tracing::info!(
            ingest = %self.ingest.bind_address,
            queue_depth = self.ingest.queue_depth,
            request_timeout_ms = self.ingest.request_timeout_ms,
            window = self.store.window_capacity,
            exclude_inconsistent = self.store.exclude_inconsistent,
            threshold = self.alert.threshold_percent,
            snapshot_ms = self.snapshot.interval_ms,
            api = if self.api.enabled { self.api.bind_address.as_str() } else { "disabled" },
            "hub configuration"
        );
    }
}
