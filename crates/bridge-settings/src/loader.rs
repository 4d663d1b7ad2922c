//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BridgeSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `BRIDGE_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{BridgeSettings, ModelProvider};

/// Resolve the default settings path (`~/.bridge/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".bridge").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<BridgeSettings> {
    let defaults = serde_json::to_value(BridgeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let mut merged = defaults;
        overlay(&mut merged, serde_json::from_str(&content)?);
        merged
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Lay a partial settings document over `base` in place.
///
/// Nested objects are walked key by key, anything else in `layer` replaces
/// what `base` holds, and `null` anywhere in `layer` means "not set".
pub fn overlay(base: &mut Value, layer: Value) {
    let Value::Object(fields) = layer else {
        if !layer.is_null() {
            *base = layer;
        }
        return;
    };
    if !base.is_object() {
        *base = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(slots) = base {
        for (key, value) in fields {
            match slots.get_mut(&key) {
                Some(slot) => overlay(slot, value),
                None if !value.is_null() => {
                    let mut fresh = Value::Null;
                    overlay(&mut fresh, value);
                    slots.insert(key, fresh);
                }
                None => {}
            }
        }
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_env_overrides<F>(settings: &mut BridgeSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("BRIDGE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16_in("BRIDGE_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("BRIDGE_LOG_LEVEL") {
        match parse_level(&v) {
            Some(level) => settings.logging.level = level.to_string(),
            None => tracing::warn!(key = "BRIDGE_LOG_LEVEL", value = %v, "invalid log level, ignoring"),
        }
    }
    if let Some(v) = env.string("BRIDGE_LOG_FORMAT") {
        match v.to_ascii_lowercase().as_str() {
            f @ ("json" | "pretty") => settings.logging.format = f.to_string(),
            _ => tracing::warn!(key = "BRIDGE_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
    if let Some(v) = env.string("BRIDGE_MODEL_PROVIDER") {
        match ModelProvider::parse(&v) {
            Some(p) => settings.pipeline.model.provider = p,
            None => tracing::warn!(key = "BRIDGE_MODEL_PROVIDER", value = %v, "unknown provider, ignoring"),
        }
    }
    if let Some(v) = env.string("BRIDGE_MODEL") {
        settings.pipeline.model.model = v;
    }
    if let Some(v) = env.string("BRIDGE_MODEL_BASE_URL") {
        settings.pipeline.model.base_url = v;
    }
    if let Some(v) = env.string("BRIDGE_RECORDS_DB") {
        settings.logging.records_db = Some(v);
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Normalise a log level name. Accepts any case.
pub fn parse_level(val: &str) -> Option<&'static str> {
    match val.to_ascii_lowercase().as_str() {
        "error" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u16_in(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.string(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── overlay ─────────────────────────────────────────────────────

    fn overlaid(mut base: Value, layer: Value) -> Value {
        overlay(&mut base, layer);
        base
    }

    #[test]
    fn overlay_nested_override() {
        let merged = overlaid(
            serde_json::json!({"server": {"port": 8000, "host": "0.0.0.0"}}),
            serde_json::json!({"server": {"port": 9090}}),
        );
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn overlay_replaces_arrays() {
        let merged = overlaid(
            serde_json::json!({"keywords": ["a", "b", "c"]}),
            serde_json::json!({"keywords": ["z"]}),
        );
        assert_eq!(merged["keywords"], serde_json::json!(["z"]));
    }

    #[test]
    fn overlay_null_keeps_base() {
        let merged = overlaid(
            serde_json::json!({"a": 1, "b": {"c": 2}}),
            serde_json::json!({"a": null, "b": {"c": null}}),
        );
        assert_eq!(merged, serde_json::json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn overlay_new_keys_drop_nested_nulls() {
        let merged = overlaid(
            serde_json::json!({}),
            serde_json::json!({"extra": {"kept": 1, "unset": null}, "gone": null}),
        );
        assert_eq!(merged, serde_json::json!({"extra": {"kept": 1}}));
    }

    #[test]
    fn overlay_primitive_replaces_object() {
        let merged = overlaid(
            serde_json::json!({"a": {"nested": true}}),
            serde_json::json!({"a": 42}),
        );
        assert_eq!(merged["a"], 42);
    }

    #[test]
    fn overlay_object_replaces_primitive() {
        let merged = overlaid(
            serde_json::json!({"a": 42}),
            serde_json::json!({"a": {"nested": true}}),
        );
        assert_eq!(merged["a"], serde_json::json!({"nested": true}));
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = read_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 8000);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9090}, "pipeline": {"model": {"provider": "openai"}}}"#,
        )
        .unwrap();

        let settings = read_file_layer(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.pipeline.model.provider, ModelProvider::Openai);
        assert_eq!(settings.pipeline.model.model, "gpt-4o");
        assert_eq!(settings.pipeline.custom_event, "on_easter_egg");
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn invalid_value_in_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"maxMessageSize": 0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = BridgeSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("BRIDGE_HOST", "127.0.0.1"),
                ("BRIDGE_PORT", "9000"),
                ("BRIDGE_LOG_LEVEL", "DEBUG"),
                ("BRIDGE_LOG_FORMAT", "pretty"),
                ("BRIDGE_MODEL_PROVIDER", "openai"),
                ("BRIDGE_MODEL", "gpt-4o-mini"),
                ("BRIDGE_MODEL_BASE_URL", "http://localhost:1234/v1"),
                ("BRIDGE_RECORDS_DB", "/tmp/records.db"),
            ]),
        );
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.logging.level, "debug");
        assert_eq!(s.logging.format, "pretty");
        assert_eq!(s.pipeline.model.provider, ModelProvider::Openai);
        assert_eq!(s.pipeline.model.model, "gpt-4o-mini");
        assert_eq!(s.pipeline.model.base_url, "http://localhost:1234/v1");
        assert_eq!(s.logging.records_db.as_deref(), Some("/tmp/records.db"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = BridgeSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[
                ("BRIDGE_PORT", "0"),
                ("BRIDGE_LOG_LEVEL", "loud"),
                ("BRIDGE_LOG_FORMAT", "xml"),
                ("BRIDGE_MODEL_PROVIDER", "mystery"),
                ("BRIDGE_HOST", ""),
            ]),
        );
        let d = BridgeSettings::default();
        assert_eq!(s.server.port, d.server.port);
        assert_eq!(s.server.host, d.server.host);
        assert_eq!(s.logging.level, d.logging.level);
        assert_eq!(s.logging.format, d.logging.format);
        assert_eq!(s.pipeline.model.provider, d.pipeline.model.provider);
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_u16_bounds() {
        assert_eq!(parse_u16_range("9090", 1, 65535), Some(9090));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u16_range("abc", 1, 65535), None);
    }

    #[test]
    fn parse_level_variants() {
        assert_eq!(parse_level("WARNING"), Some("warn"));
        assert_eq!(parse_level("Trace"), Some("trace"));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn settings_path_is_under_home() {
        assert!(settings_path().ends_with(".bridge/settings.json"));
    }
}
