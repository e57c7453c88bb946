//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HearthSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HEARTH_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::HearthSettings;
use crate::units::{Capacity, Millis, parse_duration_ms, parse_size};

/// Resolve the settings path: `$HEARTH_CONFIG`, else `./hearth.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("HEARTH_CONFIG")
        .ok()
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from("hearth.json"), PathBuf::from)
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HearthSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields the defaults; invalid JSON or an invalid value is an
/// error.
pub fn load_settings_from_path(path: &Path) -> Result<HearthSettings> {
    let defaults = serde_json::to_value(HearthSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HearthSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value wins.
pub fn apply_env_overrides(settings: &mut HearthSettings) {
    // ── Database ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("HEARTH_DATABASE_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = read_env_u64("HEARTH_DB_POOL_SIZE", 1, 1024) {
        settings.database.pool_size = u32::try_from(v).unwrap_or(settings.database.pool_size);
    }
    if let Some(v) = read_env_u64("HEARTH_DB_BUSY_TIMEOUT_MS", 0, 600_000) {
        settings.database.busy_timeout_ms =
            u32::try_from(v).unwrap_or(settings.database.busy_timeout_ms);
    }

    // ── Caches ──────────────────────────────────────────────────────
    if let Some(v) = read_env_size("HEARTH_CACHE_DEFAULT_SIZE") {
        settings.caches.default_max_entries = v;
    }
    if let Some(v) = read_env_size("HEARTH_EVENT_CACHE_SIZE") {
        settings.caches.event_cache_size = v;
    }

    // ── Transactions / profiling / logging ──────────────────────────
    if let Some(v) = read_env_u64("HEARTH_TXN_MAX_ATTEMPTS", 1, 100) {
        settings.transactions.max_attempts =
            u32::try_from(v).unwrap_or(settings.transactions.max_attempts);
    }
    if let Some(v) = read_env_bool("HEARTH_PROFILE") {
        settings.profiling.enabled = v;
    }
    if let Some(v) = read_env_duration("HEARTH_PROFILE_INTERVAL") {
        settings.profiling.interval = v;
    }
    if let Some(v) = read_env_string("HEARTH_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_size(name: &str) -> Option<Capacity> {
    let val = std::env::var(name).ok()?;
    let result = parse_size(&val)
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| usize::try_from(n).ok())
        .map(Capacity);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid size env var, ignoring");
    }
    result
}

fn read_env_duration(name: &str) -> Option<Millis> {
    let val = std::env::var(name).ok()?;
    let result = parse_duration_ms(&val).ok().filter(|n| *n > 0).map(Millis);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid duration env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "database": {"poolSize": 10, "path": "homeserver.db"}
        });
        let source = serde_json::json!({
            "database": {"poolSize": 4}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["database"]["poolSize"], 4);
        assert_eq!(merged["database"]["path"], "homeserver.db");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.transactions.max_attempts, 5);
        assert_eq!(settings.caches.default_max_entries, Capacity(1000));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.json");
        std::fs::write(
            &path,
            r#"{
                "database": {"path": "/tmp/hs.db"},
                "caches": {"eventCacheSize": "20K"},
                "profiling": {"interval": "30s"}
            }"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.database.path, "/tmp/hs.db");
        assert_eq!(settings.database.pool_size, 10);
        assert_eq!(settings.caches.event_cache_size, Capacity(20 * 1024));
        assert_eq!(settings.profiling.interval, Millis(30_000));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn invalid_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.json");
        std::fs::write(&path, r#"{"transactions": {"maxAttempts": 0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_u64_range("5", 1, 100), Some(5));
        assert_eq!(parse_u64_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("101", 1, 100), None);
        assert_eq!(parse_u64_range("-1", 1, 100), None);
    }
}
