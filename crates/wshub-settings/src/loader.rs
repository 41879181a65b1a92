//! Layered settings: compiled defaults, then the JSON file, then `WSHUB_*`
//! environment variables.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use serde_json::map::Entry;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::HubSettings;

/// `$HOME/.wshub/settings.json`, falling back to `/tmp` without `HOME`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    home.join(".wshub").join("settings.json")
}

/// [`load_settings_from_path`] on [`settings_path`].
pub fn load_settings() -> Result<HubSettings> {
    load_settings_from_path(&settings_path())
}

/// Defaults, overlaid with `path` if it exists, overlaid with env vars.
///
/// A missing file is not an error; an unreadable or malformed one is.
pub fn load_settings_from_path(path: &Path) -> Result<HubSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<HubSettings> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(HubSettings::default());
        }
        Err(e) => return Err(e.into()),
    };
    debug!(path = %path.display(), "loading settings file");
    let overlay: Value = serde_json::from_str(&content)?;
    let merged = deep_merge(serde_json::to_value(HubSettings::default())?, overlay);
    Ok(serde_json::from_value(merged)?)
}

/// Overlay `source` onto `target`.
///
/// Objects merge key by key, recursively. Anything else in `source` replaces
/// the target value, except `null`, which leaves it untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                match base.entry(key) {
                    Entry::Occupied(mut slot) => {
                        let current = slot.get_mut().take();
                        let _ = slot.insert(deep_merge(current, value));
                    }
                    Entry::Vacant(slot) => {
                        let _ = slot.insert(value);
                    }
                }
            }
            Value::Object(base)
        }
        (target, Value::Null) => target,
        (_, source) => source,
    }
}

/// Apply `WSHUB_*` environment variable overrides.
///
/// Invalid values are ignored with a warning, keeping the file/default value.
pub fn apply_env_overrides(settings: &mut HubSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Empty values count as unset.
pub fn apply_overrides(settings: &mut HubSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("WSHUB_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("WSHUB_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "WSHUB_PORT", value = %v, "invalid u16 env var, ignoring"),
        }
    }
    if let Some(v) = read("WSHUB_MAX_CONNECTIONS") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(max) => settings.server.max_connections = max,
            None => warn!(key = "WSHUB_MAX_CONNECTIONS", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = read("WSHUB_HEARTBEAT_INTERVAL") {
        match parse_u64_range(&v, 1000, 600_000) {
            Some(ms) => settings.server.heartbeat_interval_ms = ms,
            None => warn!(key = "WSHUB_HEARTBEAT_INTERVAL", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("WSHUB_AUTH_TOKENS") {
        let tokens = parse_token_list(&v);
        if tokens.is_empty() {
            warn!(key = "WSHUB_AUTH_TOKENS", "no tokens in env var, ignoring");
        } else {
            settings.auth.tokens = tokens;
        }
    }
    if let Some(v) = read("WSHUB_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma separated token list, trimming whitespace and dropping blanks.
pub fn parse_token_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
