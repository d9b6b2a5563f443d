//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ChatwireSettings::default()`]
//! 2. If `~/.chatwire/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CHATWIRE_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ChatwireSettings;

/// Resolve the path to the settings file (`~/.chatwire/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".chatwire").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ChatwireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid combination of
/// values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ChatwireSettings> {
    load_with_overrides(path, |name| std::env::var(name).ok())
}

fn load_with_overrides(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ChatwireSettings> {
    let defaults = serde_json::to_value(ChatwireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChatwireSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    validate(&settings)?;
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

/// Apply `CHATWIRE_*` overrides read through `lookup`.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// ignored with a warning.
fn apply_overrides(settings: &mut ChatwireSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("CHATWIRE_API_URL") {
        settings.server.api_base_url = v;
    }
    if let Some(v) = env.string("CHATWIRE_SOCKET_URL") {
        settings.server.socket_url = v;
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = env.u64_in("CHATWIRE_MAX_BACKOFF_MS", 1000, 600_000) {
        settings.reconnect.max_backoff_ms = v;
    }
    if let Some(v) = env.u32_in("CHATWIRE_MAX_RECONNECT_ATTEMPTS", 1, 10_000) {
        settings.reconnect.max_attempts = Some(v);
    }

    // ── Stream / presence ───────────────────────────────────────────
    if let Some(v) = env.bool("CHATWIRE_STREAM_ENABLED") {
        settings.stream.enabled = v;
    }
    if let Some(v) = env.bool("CHATWIRE_PRESENCE_ENABLED") {
        settings.presence.enabled = v;
    }
    if let Some(v) = env.u64_in("CHATWIRE_PRESENCE_INTERVAL_MS", 1000, 3_600_000) {
        settings.presence.poll_interval_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CHATWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CHATWIRE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(settings: &ChatwireSettings) -> Result<()> {
    let reconnect = &settings.reconnect;
    if reconnect.initial_backoff_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "reconnect.initialBackoffMs must be positive".into(),
        ));
    }
    if reconnect.initial_backoff_ms > reconnect.max_backoff_ms {
        return Err(SettingsError::InvalidValue(format!(
            "reconnect.initialBackoffMs ({}) exceeds reconnect.maxBackoffMs ({})",
            reconnect.initial_backoff_ms, reconnect.max_backoff_ms
        )));
    }
    if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
        return Err(SettingsError::InvalidValue(format!(
            "reconnect.multiplier must be >= 1.0, got {}",
            reconnect.multiplier
        )));
    }
    if settings.presence.poll_interval_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "presence.pollIntervalMs must be positive".into(),
        ));
    }
    Ok(())
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

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u32_in(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        let val = (self.lookup)(name)?;
        let result = parse_u32_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
