//! # tether-settings
//!
//! Configuration management with layered sources for the Tether relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **Settings file**: `~/.tether/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = TetherSettings::default();
        let path = settings_path();
        assert!(path.ends_with("settings.json"));
    }

    #[test]
    fn env_prefix_is_shared_with_core() {
        assert!(tether_core::constants::ENV_PREFIX.starts_with("TETHER"));
    }
}
