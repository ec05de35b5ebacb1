//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LinkSettings::default()`]
//! 2. If `~/.campuslink/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CAMPUSLINK_*` environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use campuslink_core::logging::LogFormat;
use campuslink_core::retry::MaxAttempts;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{LinkSettings, OverflowPolicy};

/// Resolve the path to the settings file (`~/.campuslink/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".campuslink").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LinkSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, defaults are used. Invalid JSON or a merged
/// result that fails validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LinkSettings> {
    let defaults = serde_json::to_value(LinkSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LinkSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup` (normally the process environment).
///
/// Each variable has strict parsing rules; invalid values are ignored with a
/// warning and the file/default value stays in effect.
///
/// | variable | field |
/// |---|---|
/// | `CAMPUSLINK_SERVER_URL` | `serverUrl` |
/// | `CAMPUSLINK_MAX_RECONNECT_ATTEMPTS` | `maxReconnectAttempts` (integer or `unlimited`) |
/// | `CAMPUSLINK_BASE_DELAY_MS` | `baseDelayMs` |
/// | `CAMPUSLINK_MAX_DELAY_MS` | `maxDelayMs` |
/// | `CAMPUSLINK_JITTER_FRACTION` | `jitterFraction` |
/// | `CAMPUSLINK_CONNECT_TIMEOUT_MS` | `connectTimeoutMs` |
/// | `CAMPUSLINK_HEARTBEAT_TIMEOUT_MS` | `heartbeatTimeoutMs` |
/// | `CAMPUSLINK_QUEUE_CAPACITY` | `queue.capacity` |
/// | `CAMPUSLINK_QUEUE_OVERFLOW` | `queue.overflow` (`reject` or `dropOldest`) |
/// | `CAMPUSLINK_QUEUE_RETAIN_ON_STOP` | `queue.retainOnStop` |
/// | `CAMPUSLINK_LOG_LEVEL` | `logging.level` |
/// | `CAMPUSLINK_LOG_FORMAT` | `logging.format` (`compact` or `json`) |
pub fn apply_overrides(settings: &mut LinkSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.string("CAMPUSLINK_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env.parsed("CAMPUSLINK_MAX_RECONNECT_ATTEMPTS", parse_max_attempts) {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = env.u64("CAMPUSLINK_BASE_DELAY_MS", 1, 3_600_000) {
        settings.base_delay_ms = v;
    }
    if let Some(v) = env.u64("CAMPUSLINK_MAX_DELAY_MS", 1, 3_600_000) {
        settings.max_delay_ms = v;
    }
    if let Some(v) = env.parsed("CAMPUSLINK_JITTER_FRACTION", parse_fraction) {
        settings.jitter_fraction = v;
    }
    if let Some(v) = env.u64("CAMPUSLINK_CONNECT_TIMEOUT_MS", 1, 600_000) {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("CAMPUSLINK_HEARTBEAT_TIMEOUT_MS", 0, 3_600_000) {
        settings.heartbeat_timeout_ms = v;
    }

    // ── Queue ───────────────────────────────────────────────────────
    if let Some(v) = env.parsed("CAMPUSLINK_QUEUE_CAPACITY", |s| s.parse::<usize>().ok()) {
        settings.queue.capacity = v;
    }
    if let Some(v) = env.parsed("CAMPUSLINK_QUEUE_OVERFLOW", parse_overflow) {
        settings.queue.overflow = v;
    }
    if let Some(v) = env.parsed("CAMPUSLINK_QUEUE_RETAIN_ON_STOP", parse_bool) {
        settings.queue.retain_on_stop = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CAMPUSLINK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("CAMPUSLINK_LOG_FORMAT", parse_log_format) {
        settings.logging.format = v;
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(val.trim());
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, |s| parse_u64_range(s, min, max))
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a fraction in `0.0..=1.0`.
pub fn parse_fraction(val: &str) -> Option<f64> {
    let n: f64 = val.parse().ok()?;
    (0.0..=1.0).contains(&n).then_some(n)
}

/// Parse an attempt budget: a non-negative integer or `unlimited`.
pub fn parse_max_attempts(val: &str) -> Option<MaxAttempts> {
    if val.eq_ignore_ascii_case("unlimited") {
        return Some(MaxAttempts::Unlimited);
    }
    val.parse::<u32>().ok().map(MaxAttempts::Limited)
}

/// Parse an overflow policy name (case-insensitive, `-`/`_` tolerated).
pub fn parse_overflow(val: &str) -> Option<OverflowPolicy> {
    match val.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
        "reject" => Some(OverflowPolicy::Reject),
        "dropoldest" => Some(OverflowPolicy::DropOldest),
        _ => None,
    }
}

/// Parse a boolean flag: `true`/`false`, `1`/`0`, `yes`/`no` (case-insensitive).
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_ascii_lowercase().as_str() {
        "compact" | "text" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
