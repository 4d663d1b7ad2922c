//! # bridge-settings
//!
//! Settings are loaded from three layers, in priority order:
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **Settings file**: `~/.bridge/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `BRIDGE_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{overlay, load_settings, load_settings_from_path, settings_path};
pub use types::*;
