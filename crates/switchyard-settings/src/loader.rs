//! Layered settings loading.
//!
//! Layers, lowest first: compiled defaults, the JSON settings file, then
//! `SWITCHYARD_*` environment variables. The file layer is merged
//! structurally: nested objects combine key by key, anything else (arrays,
//! scalars) is taken whole from the file, and `null` leaves the default in
//! place. The result is validated before it is handed out.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{GatewaySettings, MessageMode, QueueMode};

/// Settings file location: `$SWITCHYARD_CONFIG`, else `~/.switchyard/settings.json`.
pub fn settings_path() -> PathBuf {
    match env_lookup("SWITCHYARD_CONFIG") {
        Some(path) => expand_home(&path),
        None => home_dir().join(".switchyard").join("settings.json"),
    }
}

/// [`load_settings_from_path`] on [`settings_path`].
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Build settings from `path` plus the environment. A missing file means
/// defaults; unreadable JSON or failed validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut layered = serde_json::to_value(GatewaySettings::default())?;
    if path.is_file() {
        let raw = std::fs::read_to_string(path)?;
        let file_layer: Value = serde_json::from_str(&raw)?;
        layered = deep_merge(layered, file_layer);
        debug!(path = %path.display(), "settings file applied");
    } else {
        debug!(path = %path.display(), "no settings file, using defaults");
    }

    let mut settings: GatewaySettings = serde_json::from_value(layered)?;
    EnvOverrides::new(env_lookup).apply(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Merge `overlay` into `base`. Objects combine per key; every other value
/// in `overlay` replaces the one in `base`; `null` in `overlay` is ignored.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    let (mut base, overlay) = match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => (base, overlay),
        (base, overlay) => return overlay_or_base(base, overlay),
    };
    for (key, value) in overlay {
        if value.is_null() {
            continue;
        }
        let combined = match base.remove(&key) {
            Some(existing) => deep_merge(existing, value),
            None => value,
        };
        let _ = base.insert(key, combined);
    }
    Value::Object(base)
}

fn overlay_or_base(base: Value, overlay: Value) -> Value {
    if overlay.is_null() { base } else { overlay }
}

/// Reject settings the pool and queue cannot operate with.
pub fn validate(settings: &GatewaySettings) -> Result<()> {
    let pool = &settings.agent.pool;
    if pool.max == 0 {
        return Err(SettingsError::InvalidValue("agent.pool.max must be at least 1".into()));
    }
    if pool.min > pool.max {
        return Err(SettingsError::InvalidValue(format!(
            "agent.pool.min ({}) exceeds agent.pool.max ({})",
            pool.min, pool.max
        )));
    }
    let queue = &settings.queue;
    if queue.max_per_session == 0 || queue.global_max_pending == 0 {
        return Err(SettingsError::InvalidValue("queue caps must be at least 1".into()));
    }
    if settings.agent.executable.trim().is_empty() {
        return Err(SettingsError::InvalidValue("agent.executable is empty".into()));
    }
    Ok(())
}

/// `SWITCHYARD_*` overrides read through a lookup function, so tests can
/// supply a map instead of touching the process environment.
///
/// Values that do not parse or fall outside their range are logged and
/// skipped.
pub struct EnvOverrides<F> {
    lookup: F,
}

impl<F> EnvOverrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Overrides backed by `lookup`.
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Apply every recognized variable to `settings`.
    pub fn apply(&self, settings: &mut GatewaySettings) {
        let agent = &mut settings.agent;
        if let Some(v) = self.text("SWITCHYARD_EXECUTABLE") {
            agent.executable = v;
        }
        if let Some(v) = self.text("SWITCHYARD_MODEL") {
            agent.model = Some(v);
        }
        if let Some(v) = self.number("SWITCHYARD_TURN_TIMEOUT_MS", 1_000..=3_600_000) {
            agent.timeout_ms = v;
        }
        if let Some(v) = self.parsed::<MessageMode>("SWITCHYARD_MESSAGE_MODE") {
            agent.message_mode = v;
        }
        if let Some(v) = self.number("SWITCHYARD_POOL_MIN", 0..=256) {
            agent.pool.min = v;
        }
        if let Some(v) = self.number("SWITCHYARD_POOL_MAX", 1..=256) {
            agent.pool.max = v;
        }
        if let Some(v) = self.number("SWITCHYARD_POOL_IDLE_TIMEOUT_MS", 1_000..=86_400_000) {
            agent.pool.idle_timeout_ms = v;
        }

        let queue = &mut settings.queue;
        if let Some(v) = self.number("SWITCHYARD_QUEUE_MAX_PER_SESSION", 1..=10_000) {
            queue.max_per_session = v;
        }
        if let Some(v) = self.number("SWITCHYARD_QUEUE_GLOBAL_MAX", 1..=100_000) {
            queue.global_max_pending = v;
        }
        if let Some(v) = self.text("SWITCHYARD_QUEUE_MODE") {
            match serde_json::from_value::<QueueMode>(Value::String(v.clone())) {
                Ok(mode) => queue.mode = mode,
                Err(_) => warn!(key = "SWITCHYARD_QUEUE_MODE", value = %v, "unknown queue mode, ignoring"),
            }
        }
        if let Some(v) = self.flag("SWITCHYARD_DEDUP_ENABLED") {
            queue.dedup.enabled = v;
        }

        if let Some(v) = self.text("SWITCHYARD_DATA_DIR") {
            settings.session.data_dir = v;
        }
        if let Some(v) = self.text("SWITCHYARD_LOG_LEVEL") {
            settings.logging.level = v;
        }
    }

    fn text(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.text(key)?;
        raw.trim()
            .parse()
            .map_err(|e| warn!(key, value = %raw, error = %e, "ignoring env override"))
            .ok()
    }

    fn number<T>(&self, key: &str, range: RangeInclusive<T>) -> Option<T>
    where
        T: FromStr + PartialOrd + std::fmt::Display,
    {
        let raw = self.text(key)?;
        let parsed = parse_in_range(&raw, &range);
        if parsed.is_none() {
            warn!(key, value = %raw, min = %range.start(), max = %range.end(), "env override out of range, ignoring");
        }
        parsed
    }

    fn flag(&self, key: &str) -> Option<bool> {
        let raw = self.text(key)?;
        let parsed = parse_flag(&raw);
        if parsed.is_none() {
            warn!(key, value = %raw, "env override is not a boolean, ignoring");
        }
        parsed
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Home directory, or `/tmp` when `HOME` is unset.
pub fn home_dir() -> PathBuf {
    env_lookup("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

/// `on`/`off` style flag: `true|1|yes|on` or `false|0|no|off`, any case.
pub fn parse_flag(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if ["true", "1", "yes", "on"].iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if ["false", "0", "no", "off"].iter().any(|f| raw.eq_ignore_ascii_case(f)) {
        Some(false)
    } else {
        None
    }
}

/// Parse `raw` and keep it only when it lies in `range`.
pub fn parse_in_range<T>(raw: &str, range: &RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| range.contains(n))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
