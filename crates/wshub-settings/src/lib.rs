//! # wshub-settings
//!
//! Configuration management with layered sources for the broadcast hub.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`HubSettings::default()`]
//! 2. **Settings file** - `~/.wshub/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** - `WSHUB_*` overrides (highest priority)
//!
//! The binary applies CLI flags on top of the result.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
