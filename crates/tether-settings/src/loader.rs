//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tether_core::PermissionMode;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{BackendKindSetting, TetherSettings};

/// Resolve the path to the settings file (`~/.tether/settings.json`).
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
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<TetherSettings> {
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

    Ok(serde_json::from_value(merged)?)
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

/// Apply `TETHER_*` environment overrides from the process environment.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides using `lookup` to resolve variable names.
///
/// Invalid values are ignored with a warning, keeping the file/default value.
pub fn apply_overrides(settings: &mut TetherSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read_string = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    // ── Backend selection ───────────────────────────────────────────
    if let Some(v) = read_string("TETHER_BACKEND") {
        match parse_backend(&v) {
            Some(kind) => settings.backend = kind,
            None => warn!(key = "TETHER_BACKEND", value = %v, "invalid backend env var, ignoring"),
        }
    }

    // ── Mode defaults ───────────────────────────────────────────────
    if let Some(v) = read_string("TETHER_PERMISSION_MODE") {
        match v.parse::<PermissionMode>() {
            Ok(mode) => settings.defaults.permission_mode = mode,
            Err(e) => warn!(key = "TETHER_PERMISSION_MODE", error = %e, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read_string("TETHER_MODEL") {
        settings.defaults.model = Some(v);
    }

    // ── Backend binaries and endpoints ──────────────────────────────
    if let Some(v) = read_string("TETHER_EXEC_BIN") {
        settings.exec.binary = v;
    }
    if let Some(v) = read_string("TETHER_SERVER_BIN") {
        settings.server.binary = v;
    }
    if let Some(v) = read_string("TETHER_SERVER_URL") {
        settings.server.base_url = Some(v);
    }
    if let Some(v) = read_string("TETHER_SERVER_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "TETHER_SERVER_PORT", value = %v, "invalid u16 env var, ignoring"),
        }
    }

    // ── Orchestrator ────────────────────────────────────────────────
    if let Some(v) = read_string("TETHER_POLL_INTERVAL_MS") {
        match parse_u64_range(&v, 10, 10_000) {
            Some(ms) => settings.orchestrator.poll_interval_ms = ms,
            None => warn!(key = "TETHER_POLL_INTERVAL_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read_string("TETHER_KEEPALIVE_MS") {
        match parse_u64_range(&v, 100, 600_000) {
            Some(ms) => settings.orchestrator.keep_alive_interval_ms = ms,
            None => warn!(key = "TETHER_KEEPALIVE_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_string("TETHER_LOG_RAW_EVENTS") {
        match parse_bool(&v) {
            Some(flag) => settings.logging.raw_events = flag,
            None => warn!(key = "TETHER_LOG_RAW_EVENTS", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a backend selector (`exec` / `server`).
pub fn parse_backend(val: &str) -> Option<BackendKindSetting> {
    match val.trim().to_lowercase().as_str() {
        "exec" | "process" => Some(BackendKindSetting::Exec),
        "server" | "http" => Some(BackendKindSetting::Server),
        _ => None,
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
