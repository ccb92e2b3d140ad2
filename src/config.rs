//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::admission::RuleSettings;
use crate::error::{Result, TurnstileError};
use crate::store::RetryPolicy;

/// Prefix of environment variables overriding file settings, e.g.
/// `TURNSTILE__STORAGE__BACKEND=best_effort`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter rules
    #[serde(default)]
    pub limits: RuleSettings,

    /// Tracker storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Which tracker store strategy to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Serializable document transactions; exact limits.
    #[default]
    Transactional,
    /// Single read and pipelined write; limits may be exceeded under races.
    BestEffort,
}

/// Tracker storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store strategy
    #[serde(default)]
    pub backend: BackendKind,

    /// Namespace prepended to every tracker key, e.g. `"shop:prod"`
    #[serde(default)]
    pub key_namespace: Option<String>,

    /// Conflict replay policy for the transactional backend
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-request backend deadline in milliseconds; 0 waits indefinitely
    #[serde(default = "default_deadline_millis")]
    pub deadline_millis: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            key_namespace: None,
            retry: RetryPolicy::default(),
            deadline_millis: default_deadline_millis(),
        }
    }
}

fn default_deadline_millis() -> u64 {
    500
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}
