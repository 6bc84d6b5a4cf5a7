//! Settings types.
//!
//! Every struct deserializes with `#[serde(rename_all = "camelCase", default)]`
//! so a partial user file only needs the keys it changes.

mod agent;
mod queue;
mod routing;

pub use agent::*;
pub use queue::*;
pub use routing::*;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Settings schema version.
    pub version: String,
    /// Gateway instance name.
    pub name: String,
    /// Worker invocation, pool bounds and model failover.
    pub agent: AgentSettings,
    /// Session identity and data directory.
    pub session: SessionSettings,
    /// Queueing, dedup and backpressure.
    pub queue: QueueSettings,
    /// Multi-agent routing.
    pub agents: AgentsSettings,
    /// Per-channel routing, role and message-mode configuration.
    pub channels: HashMap<String, ChannelSettings>,
    /// Role workspaces and capabilities.
    pub roles: RolesSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "switchyard".to_string(),
            agent: AgentSettings::default(),
            session: SessionSettings::default(),
            queue: QueueSettings::default(),
            agents: AgentsSettings::default(),
            channels: HashMap::new(),
            roles: RolesSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl GatewaySettings {
    /// Channel configuration, if any.
    pub fn channel(&self, name: &str) -> Option<&ChannelSettings> {
        self.channels.get(name)
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let json = serde_json::json!({
            "agent": {"model": "anthropic/claude-sonnet", "pool": {"max": 8}},
            "queue": {"mode": "individual"}
        });
        let settings: GatewaySettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.agent.model.as_deref(), Some("anthropic/claude-sonnet"));
        assert_eq!(settings.agent.pool.max, 8);
        assert_eq!(settings.agent.pool.min, 1);
        assert_eq!(settings.queue.mode, QueueMode::Individual);
        assert_eq!(settings.queue.max_per_session, 15);
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(GatewaySettings::default()).unwrap();
        assert!(value["queue"].get("maxPerSession").is_some());
        assert!(value["agent"]["pool"].get("idleTimeoutMs").is_some());
        assert!(value["session"].get("dmScope").is_some());
    }
}
