//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{
    ClusterBackend, MAX_PING_INTERVAL_MS, MAX_TIMEOUT_MS, MIN_LIVENESS_MS, MIN_REGISTRY_TTL_MS,
    TetherSettings,
};

/// Resolve the default settings file path (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid combination of
/// values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
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

/// Apply `TETHER_*` overrides read through `lookup`.
///
/// Numbers must parse and fall within range; invalid values are ignored
/// with a warning so a typo never takes the relay down.
pub fn apply_overrides<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("TETHER_PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64_in("TETHER_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v as usize;
    }

    // ── Relay ───────────────────────────────────────────────────────
    if let Some(v) = env.u64_in("TETHER_DEFAULT_TIMEOUT_MS", 1, MAX_TIMEOUT_MS) {
        settings.relay.default_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("TETHER_MAX_TIMEOUT_MS", 1, MAX_TIMEOUT_MS) {
        settings.relay.max_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("TETHER_PING_INTERVAL_MS", MIN_LIVENESS_MS, MAX_PING_INTERVAL_MS) {
        settings.relay.ping_interval_ms = v;
    }
    if let Some(v) = env.u64_in("TETHER_LIVENESS_TIMEOUT_MS", MIN_LIVENESS_MS, MAX_TIMEOUT_MS) {
        settings.relay.liveness_timeout_ms = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_API_TOKEN") {
        settings.auth.api_token = Some(v);
    }

    // ── Cluster ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_INSTANCE_ID") {
        settings.cluster.instance_id = Some(v);
    }
    if let Some(v) = env.string("TETHER_CLUSTER_BACKEND") {
        match v.to_lowercase().as_str() {
            "memory" => settings.cluster.backend = ClusterBackend::Memory,
            "redis" => settings.cluster.backend = ClusterBackend::Redis,
            _ => {
                tracing::warn!(
                    key = "TETHER_CLUSTER_BACKEND",
                    value = %v,
                    "unknown backend, ignoring"
                );
            }
        }
    }
    if let Some(v) = env.string("TETHER_REDIS_URL") {
        settings.cluster.redis_url = v;
    }
    if let Some(v) = env.u64_in("TETHER_REGISTRY_TTL_MS", MIN_REGISTRY_TTL_MS, MAX_TIMEOUT_MS) {
        settings.cluster.registry_ttl_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("TETHER_LOG_JSON") {
        settings.logging.json = v;
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

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
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

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn deep_merge_nested_objects() {
        let merged = deep_merge(
            json!({"relay": {"defaultTimeoutMs": 1, "maxTimeoutMs": 2}}),
            json!({"relay": {"defaultTimeoutMs": 9}}),
        );
        assert_eq!(merged["relay"]["defaultTimeoutMs"], 9);
        assert_eq!(merged["relay"]["maxTimeoutMs"], 2);
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2]}), json!({"a": [3]}));
        assert_eq!(merged["a"], json!([3]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.server.port, 8787);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server":{"port":9000},"auth":{"agents":{"u1":{"secret":"abc","platform":"macos"}}}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.auth.agents["u1"].platform, "macos");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }

    #[test]
    fn invalid_combination_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"relay":{"defaultTimeoutMs":5000,"maxTimeoutMs":10}}"#).unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }

    #[test]
    fn out_of_range_file_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        for body in [
            r#"{"relay":{"livenessTimeoutMs":0}}"#,
            r#"{"relay":{"maxTimeoutMs":18446744073709551615}}"#,
        ] {
            std::fs::write(&path, body).unwrap();
            assert!(load_settings_from_path(&path).is_err(), "accepted {body}");
        }
    }

    #[test]
    fn overrides_apply() {
        let mut settings = TetherSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("TETHER_PORT", "9999"),
                ("TETHER_DEFAULT_TIMEOUT_MS", "1500"),
                ("TETHER_API_TOKEN", "tok"),
                ("TETHER_CLUSTER_BACKEND", "Redis"),
                ("TETHER_INSTANCE_ID", "node-a"),
                ("TETHER_LOG_JSON", "yes"),
                ("TETHER_REGISTRY_TTL_MS", "15000"),
            ]),
        );
        assert_eq!(settings.server.port, 9999);
        assert_eq!(settings.relay.default_timeout_ms, 1500);
        assert_eq!(settings.auth.api_token.as_deref(), Some("tok"));
        assert_eq!(settings.cluster.backend, ClusterBackend::Redis);
        assert_eq!(settings.cluster.instance_id.as_deref(), Some("node-a"));
        assert_eq!(settings.cluster.registry_ttl_ms, 15_000);
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut settings = TetherSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("TETHER_PORT", "70000"),
                ("TETHER_DEFAULT_TIMEOUT_MS", "soon"),
                ("TETHER_CLUSTER_BACKEND", "etcd"),
                ("TETHER_LOG_JSON", "maybe"),
                ("TETHER_HOST", ""),
            ]),
        );
        assert_eq!(settings.server.port, 8787);
        assert_eq!(settings.relay.default_timeout_ms, 30_000);
        assert_eq!(settings.cluster.backend, ClusterBackend::Memory);
        assert!(!settings.logging.json);
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("50", 1, 100), Some(50));
        assert_eq!(parse_u64_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("-1", 0, 100), None);
    }
}
