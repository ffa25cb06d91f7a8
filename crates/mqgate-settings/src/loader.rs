//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`MqgateSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `MQGATE_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::MqgateSettings;

/// Resolve the settings file path: `$MQGATE_CONFIG`, else `./mqgate.json`.
pub fn settings_path() -> PathBuf {
    std::env::var("MQGATE_CONFIG")
        .ok()
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from("mqgate.json"), PathBuf::from)
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MqgateSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the merged values fail validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<MqgateSettings> {
    let defaults = serde_json::to_value(MqgateSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MqgateSettings = serde_json::from_value(merged)?;
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
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut MqgateSettings) {
    // ── Gate ────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("MQGATE_LISTEN_ADDR") {
        settings.gate.listen_addr = v;
    }
    if let Some(v) = read_env_string("MQGATE_SERVER_ID") {
        settings.gate.server_id = v;
    }
    if let Some(v) = read_env_range("MQGATE_CONCURRENT_TASKS", 1, 100_000) {
        settings.gate.concurrent_tasks = v;
    }
    if let Some(v) = read_env_range("MQGATE_BUF_SIZE", 64, 16 * 1024 * 1024) {
        settings.gate.buf_size = v;
    }
    if let Some(v) = read_env_range("MQGATE_MAX_PACK_SIZE", 64, 256 * 1024 * 1024) {
        settings.gate.max_pack_size = v;
    }
    if let Some(v) = read_env_range("MQGATE_OVER_TIME_MS", 1, 3_600_000) {
        settings.gate.over_time_ms = v;
    }
    if let Some(v) = read_env_range("MQGATE_HEARTBEAT_MS", 0, 86_400_000) {
        settings.gate.heartbeat_ms = v;
    }

    // ── RPC ─────────────────────────────────────────────────────────
    if let Some(v) = read_env_range("MQGATE_RPC_WAIT_TIMEOUT_MS", 1, 3_600_000) {
        settings.rpc.wait_timeout_ms = v;
    }
    if let Some(v) = read_env_range("MQGATE_RPC_CALL_TIMEOUT_MS", 1, 3_600_000) {
        settings.rpc.call_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("MQGATE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("MQGATE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and keep it only if it lies in `min..=max`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.parse().ok().filter(|n| (min..=max).contains(n))
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_with<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let val = std::env::var(name).ok()?;
    let parsed = parse(&val);
    if parsed.is_none() {
        tracing::warn!(key = name, value = %val, "ignoring unparseable env override");
    }
    parsed
}

fn read_env_bool(name: &str) -> Option<bool> {
    read_env_with(name, parse_bool)
}

fn read_env_range<T>(name: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    read_env_with(name, |val| parse_in_range(val, min, max))
}
