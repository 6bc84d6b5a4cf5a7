//! Errors raised while loading or watching settings.

use thiserror::Error;

/// Failure to produce a usable [`GatewaySettings`](crate::GatewaySettings).
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("settings file unreadable: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON, or does not fit the schema.
    #[error("settings file is not valid: {0}")]
    Json(#[from] serde_json::Error),
    /// Parsed fine, but a value is unusable (pool bounds, empty executable).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
    /// The file watcher could not be registered.
    #[error("cannot watch settings file: {0}")]
    Watch(#[from] notify::Error),
}

/// Settings result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_cause() {
        let io = SettingsError::from(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"));
        assert!(io.to_string().starts_with("settings file unreadable"));
        assert!(io.to_string().contains("denied"));

        let json = SettingsError::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert!(json.to_string().starts_with("settings file is not valid"));

        let invalid = SettingsError::InvalidValue("agent.pool.max must be at least 1".into());
        assert_eq!(invalid.to_string(), "invalid settings value: agent.pool.max must be at least 1");
    }
}
