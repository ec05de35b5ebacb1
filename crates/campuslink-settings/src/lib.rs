//! # campuslink-settings
//!
//! Configuration for the campuslink connection manager.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LinkSettings::default()`]
//! 2. **User file**: `~/.campuslink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CAMPUSLINK_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned. There is no global
//! settings instance: each session is opened with the settings it was given.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = LinkSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = LinkSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server_url, "ws://127.0.0.1:5000/realtime");
        assert_eq!(settings.base_delay_ms, 1000);
        assert_eq!(settings.connect_timeout_ms, 20_000);
    }
}
