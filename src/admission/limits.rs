//! Limiter configuration and its validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Minimum spacing between two accepted requests when none is configured.
pub const DEFAULT_MIN_REQUEST_INTERVAL_MILLIS: i64 = 200;
/// Window length when none is configured.
pub const DEFAULT_WINDOW_SIZE_MILLIS: i64 = 60_000;
/// Accepted requests per window when none is configured.
pub const DEFAULT_MAX_REQUESTS_PER_WINDOW: i64 = 10;
/// Record lifetime used when `expiration_seconds` is zero.
pub const DEFAULT_EXPIRATION_SECONDS: u64 = 3600;

/// Limiter settings as they arrive from a file or the environment.
///
/// Values are signed so that a negative entry is reported as a configuration
/// error instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LimiterSettings {
    /// Time between two accepted requests in milliseconds. 0 disables the check.
    pub min_request_interval_millis: i64,
    /// Fixed window length in milliseconds. 0 disables the check.
    pub window_size_millis: i64,
    /// Accepted requests allowed per window.
    pub max_requests_per_window: i64,
    /// Record lifetime in seconds. 0 selects the default.
    pub expiration_seconds: i64,
    /// Reject (instead of admit) when the tracker store fails.
    pub abort_on_storage_failure: bool,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            min_request_interval_millis: DEFAULT_MIN_REQUEST_INTERVAL_MILLIS,
            window_size_millis: DEFAULT_WINDOW_SIZE_MILLIS,
            max_requests_per_window: DEFAULT_MAX_REQUESTS_PER_WINDOW,
            expiration_seconds: 0,
            abort_on_storage_failure: false,
        }
    }
}

/// Validated, immutable limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    min_request_interval_millis: u64,
    window_size_millis: u64,
    max_requests_per_window: u64,
    expiration_seconds: u64,
    abort_on_storage_failure: bool,
}

impl LimiterConfig {
    /// Validate raw settings.
    pub fn new(settings: &LimiterSettings) -> Result<Self> {
        Ok(Self {
            min_request_interval_millis: non_negative(
                "min_request_interval_millis",
                settings.min_request_interval_millis,
            )?,
            window_size_millis: non_negative("window_size_millis", settings.window_size_millis)?,
            max_requests_per_window: non_negative(
                "max_requests_per_window",
                settings.max_requests_per_window,
            )?,
            expiration_seconds: non_negative("expiration_seconds", settings.expiration_seconds)?,
            abort_on_storage_failure: settings.abort_on_storage_failure,
        })
    }

    pub fn min_request_interval_millis(&self) -> u64 {
        self.min_request_interval_millis
    }

    pub fn window_size_millis(&self) -> u64 {
        self.window_size_millis
    }

    pub fn max_requests_per_window(&self) -> u64 {
        self.max_requests_per_window
    }

    pub fn abort_on_storage_failure(&self) -> bool {
        self.abort_on_storage_failure
    }

    /// Record lifetime, with the default substituted for zero.
    pub fn expiration(&self) -> Duration {
        match self.expiration_seconds {
            0 => Duration::from_secs(DEFAULT_EXPIRATION_SECONDS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Index of the fixed window containing `now_millis`, or 0 when windows are disabled.
    pub fn window_index(&self, now_millis: i64) -> i64 {
        match self.window_size_millis {
            0 => 0,
            size => now_millis.div_euclid(size as i64),
        }
    }

    /// Epoch milliseconds at which a record touched at `now_millis` may be reclaimed.
    pub fn expires_at_millis(&self, now_millis: i64) -> i64 {
        let lifetime = i64::try_from(self.expiration().as_millis()).unwrap_or(i64::MAX);
        now_millis.saturating_add(lifetime)
    }
}

impl TryFrom<LimiterSettings> for LimiterConfig {
    type Error = TurnstileError;

    fn try_from(settings: LimiterSettings) -> Result<Self> {
        Self::new(&settings)
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_request_interval_millis: DEFAULT_MIN_REQUEST_INTERVAL_MILLIS as u64,
            window_size_millis: DEFAULT_WINDOW_SIZE_MILLIS as u64,
            max_requests_per_window: DEFAULT_MAX_REQUESTS_PER_WINDOW as u64,
            expiration_seconds: 0,
            abort_on_storage_failure: false,
        }
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| TurnstileError::Config(format!("{} must not be negative, got {}", field, value)))
}
