//! Logging settings.

use campuslink_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Log level and output format for the stderr subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `"info"` or `"campuslink_realtime=debug"`.
    pub level: String,
    /// Text or JSON lines.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
