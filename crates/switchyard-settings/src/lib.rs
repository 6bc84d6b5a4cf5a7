//! # switchyard-settings
//!
//! Configuration for the switchyard gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **User file**: `~/.switchyard/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables**: `SWITCHYARD_*` overrides (highest priority)
//!
//! The gateway treats a loaded [`GatewaySettings`] as an immutable snapshot.
//! [`watcher::watch_settings`] reports file changes so the caller can load a
//! fresh snapshot and swap it in.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;
pub mod watcher;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, expand_home, home_dir, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.name, "switchyard");
        assert_eq!(settings.agent.executable, "pi");
        assert_eq!(settings.agent.pool.min, 1);
        assert_eq!(settings.agent.pool.max, 4);
        assert_eq!(settings.agent.pool.idle_timeout_ms, 300_000);
        assert_eq!(settings.agent.timeout_ms, 120_000);
        assert_eq!(settings.agent.message_mode, MessageMode::Steer);
        assert_eq!(settings.queue.max_per_session, 15);
        assert_eq!(settings.queue.global_max_pending, 100);
        assert_eq!(settings.queue.collect_debounce_ms, 1500);
        assert_eq!(settings.queue.pool_wait_ttl_ms, 30_000);
        assert_eq!(settings.queue.dedup.cache_size, 1000);
        assert_eq!(settings.queue.dedup.ttl_ms, 60_000);
        assert_eq!(settings.session.dm_scope, DmScope::Main);
        assert!(settings.agents.list.is_empty());
    }

    #[test]
    fn deep_merge_re_exported() {
        let a = serde_json::json!({"x": 1});
        let b = serde_json::json!({"y": 2});
        let merged = deep_merge(a, b);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
