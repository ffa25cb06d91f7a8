//! # mqgate-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MqgateSettings::default()`]
//! 2. **Settings file**: `$MQGATE_CONFIG` or `./mqgate.json` (deep-merged over defaults)
//! 3. **Environment variables**: `MQGATE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<MqgateSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from the default path with env var
/// overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static MqgateSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            MqgateSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: MqgateSettings) -> std::result::Result<(), MqgateSettings> {
    SETTINGS.set(settings)
}
