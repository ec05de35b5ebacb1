//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` to match the JSON
//! settings file. Each type implements [`Default`] with production values and
//! is marked `#[serde(default)]`, so partial JSON is accepted.

mod logging;
mod queue;

pub use logging::*;
pub use queue::*;

use std::time::Duration;

use campuslink_core::retry::MaxAttempts;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the connection manager.
///
/// # JSON Format
///
/// ```json
/// {
///   "serverUrl": "wss://shop.campus.example/realtime",
///   "maxReconnectAttempts": "unlimited",
///   "baseDelayMs": 500,
///   "queue": { "overflow": "dropOldest" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkSettings {
    /// Push server endpoint.
    pub server_url: String,
    /// Failed attempts tolerated before entering the failed state.
    pub max_reconnect_attempts: MaxAttempts,
    /// Backoff base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Symmetric jitter applied to each delay, `0.0..=1.0`.
    pub jitter_fraction: f64,
    /// Bound on a single connect attempt in milliseconds.
    pub connect_timeout_ms: u64,
    /// Silence on an open connection after which it is considered dropped.
    /// `0` disables the liveness check.
    pub heartbeat_timeout_ms: u64,
    /// Outbound queue behaviour.
    pub queue: QueueSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5000/realtime".to_string(),
            max_reconnect_attempts: MaxAttempts::Limited(5),
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter_fraction: 0.5,
            connect_timeout_ms: 20_000,
            heartbeat_timeout_ms: 60_000,
            queue: QueueSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl LinkSettings {
    /// Backoff base delay.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff cap.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Connect attempt bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Liveness timeout, `None` when disabled.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_ms > 0).then(|| Duration::from_millis(self.heartbeat_timeout_ms))
    }

    /// Reject combinations the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("serverUrl must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(SettingsError::InvalidValue(format!(
                "jitterFraction must be within 0..=1, got {}",
                self.jitter_fraction
            )));
        }
        if self.base_delay_ms == 0 {
            return Err(SettingsError::InvalidValue("baseDelayMs must be positive".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "maxDelayMs ({}) must not be below baseDelayMs ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connectTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}
