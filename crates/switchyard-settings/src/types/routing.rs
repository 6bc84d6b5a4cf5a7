//! Session identity, multi-agent routing, channel and role settings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::agent::MessageMode;

/// How direct messages map onto sessions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    /// Every DM shares one main session.
    #[default]
    Main,
    /// One session per sender across channels.
    PerPeer,
    /// One session per sender per channel.
    PerChannelPeer,
}

/// Session identity and storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// DM session scoping.
    pub dm_scope: DmScope,
    /// Root for per-session worker directories and default role workspaces.
    pub data_dir: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dm_scope: DmScope::Main,
            data_dir: "~/.switchyard".to_string(),
        }
    }
}

/// Multi-agent routing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsSettings {
    /// Known agents. Prefix commands only route to these.
    pub list: Vec<AgentDefinition>,
    /// Default agent id (falls back to `main`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Static source-to-agent bindings.
    pub bindings: Vec<AgentBinding>,
}

impl AgentsSettings {
    /// Look up an agent by id.
    pub fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.list.iter().find(|a| a.id == id)
    }
}

/// One agent definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefinition {
    /// Agent id used in session keys and `/id` prefixes.
    pub id: String,
    /// Working directory override for this agent's workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// Model override (`provider/model`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Role override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Static binding from a message source to an agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentBinding {
    /// Target agent id.
    pub agent_id: String,
    /// Every specified field must match the source.
    #[serde(rename = "match")]
    pub matcher: BindingMatch,
}

/// Match criteria of a binding. Unset fields are wildcards.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindingMatch {
    /// Channel name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Bot account id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Guild id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    /// Specific peer (DM sender or group chat).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerMatch>,
}

/// Peer selector for a binding.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerMatch {
    /// `dm`, `group` or `channel`.
    pub kind: String,
    /// Sender id for `dm`, chat id otherwise.
    pub id: String,
}

/// Per-channel configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Channel-wide default role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Channel-wide message mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_mode: Option<MessageMode>,
    /// Senders that receive the allow-list priority bonus.
    pub allow_from: Vec<String>,
    /// Per-account overrides.
    pub accounts: HashMap<String, AccountSettings>,
    /// Per-group roles. `*` matches any group.
    pub groups: HashMap<String, GroupSettings>,
    /// Per-guild roles.
    pub guilds: HashMap<String, GuildSettings>,
}

/// Per-account overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountSettings {
    /// Account default role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Account message mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_mode: Option<MessageMode>,
    /// Account-scoped groups; replaces the channel-level map when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<HashMap<String, GroupSettings>>,
}

/// Group role configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSettings {
    /// Group role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Per-topic roles.
    pub topics: HashMap<String, TopicSettings>,
}

/// Forum topic role configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicSettings {
    /// Topic role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Guild role configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuildSettings {
    /// Guild role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Per-channel roles inside the guild.
    pub channels: HashMap<String, TopicSettings>,
}

/// Role workspaces and capability layers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolesSettings {
    /// Explicit working directory per role.
    pub workspace_dirs: HashMap<String, String>,
    /// Role-specific resource layers.
    pub capabilities: HashMap<String, RoleCapabilities>,
}

/// Role-specific resources. These take precedence over gateway-wide lists.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleCapabilities {
    /// Skills.
    pub skills: Vec<String>,
    /// Extensions.
    pub extensions: Vec<String>,
    /// Prompt templates.
    pub prompt_templates: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_uses_match_key() {
        let json = serde_json::json!({
            "agentId": "code",
            "match": {"channel": "telegram", "peer": {"kind": "dm", "id": "42"}}
        });
        let binding: AgentBinding = serde_json::from_value(json).unwrap();
        assert_eq!(binding.agent_id, "code");
        assert_eq!(binding.matcher.channel.as_deref(), Some("telegram"));
        assert_eq!(binding.matcher.peer.unwrap().id, "42");
    }

    #[test]
    fn dm_scope_kebab_case() {
        let scope: DmScope = serde_json::from_str("\"per-channel-peer\"").unwrap();
        assert_eq!(scope, DmScope::PerChannelPeer);
    }

    #[test]
    fn channel_nested_groups_and_topics() {
        let json = serde_json::json!({
            "role": "general",
            "messageMode": "interrupt",
            "groups": {"-100": {"role": "ops", "topics": {"7": {"role": "triage"}}}},
            "accounts": {"work": {"role": "work"}}
        });
        let channel: ChannelSettings = serde_json::from_value(json).unwrap();
        assert_eq!(channel.message_mode, Some(MessageMode::Interrupt));
        assert_eq!(channel.groups["-100"].topics["7"].role.as_deref(), Some("triage"));
        assert!(channel.accounts["work"].groups.is_none());
    }

    #[test]
    fn agents_lookup() {
        let agents = AgentsSettings {
            list: vec![AgentDefinition {
                id: "code".into(),
                ..AgentDefinition::default()
            }],
            ..AgentsSettings::default()
        };
        assert!(agents.get("code").is_some());
        assert!(agents.get("main").is_none());
    }
}
