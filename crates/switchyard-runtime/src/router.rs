//! Session routing.
//!
//! [`SessionRouter`] maps an inbound message onto the agent that serves it,
//! the [`SessionKey`] that identifies the conversation, the role whose
//! capability profile the worker runs with and that role's working
//! directory. Everything here is a pure function of the message and a
//! settings snapshot.
//!
//! Agent resolution, first match wins:
//! 1. static bindings, scored peer 8 / guild 4 / account 2 / channel 1
//! 2. a `/agentId` prefix naming a listed agent (the prefix is stripped)
//! 3. the default agent

use std::path::PathBuf;

use serde::Serialize;
use switchyard_core::{ChatType, MessageSource, SessionKey};
use switchyard_settings::{
    AgentBinding, DmScope, GatewaySettings, GroupSettings, MessageMode, expand_home,
};
use tracing::debug;

/// Agent used when nothing else is configured.
pub const DEFAULT_AGENT_ID: &str = "main";
/// Role used when no channel, group or agent names one.
pub const DEFAULT_ROLE: &str = "default";

/// How the agent was chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMatch {
    /// A static binding matched.
    Binding,
    /// A `/agent` prefix matched.
    Prefix,
    /// Fallback to the default agent.
    Default,
}

/// Routing decision for one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Conversation identity.
    pub session_key: SessionKey,
    /// Agent serving the conversation.
    pub agent_id: String,
    /// Message text after prefix stripping.
    pub text: String,
    /// Which rule picked the agent.
    pub matched_by: RouteMatch,
}

/// Pure routing over a settings snapshot.
#[derive(Clone, Copy, Debug)]
pub struct SessionRouter<'a> {
    settings: &'a GatewaySettings,
}

impl<'a> SessionRouter<'a> {
    /// Router over `settings`.
    pub fn new(settings: &'a GatewaySettings) -> Self {
        Self { settings }
    }

    /// Route a message. An explicit key (cron, webhook) is kept as is, but the
    /// agent is still resolved so prefix commands work everywhere.
    pub fn route(&self, source: &MessageSource, text: &str, explicit_key: Option<&SessionKey>) -> Route {
        let (agent_id, text, matched_by) = self.resolve_agent(source, text);
        let session_key = match explicit_key {
            Some(key) => key.clone(),
            None => self.session_key(source, &agent_id),
        };
        debug!(session_key = %session_key, agent_id = %agent_id, matched_by = ?matched_by, "routed message");
        Route {
            session_key,
            agent_id,
            text,
            matched_by,
        }
    }

    /// Agent id, rewritten text and the rule that matched.
    pub fn resolve_agent(&self, source: &MessageSource, text: &str) -> (String, String, RouteMatch) {
        if let Some(agent_id) = self.match_binding(source) {
            return (agent_id.to_string(), text.to_string(), RouteMatch::Binding);
        }
        if let Some((agent_id, rest)) = self.match_prefix(text) {
            return (agent_id.to_string(), rest.to_string(), RouteMatch::Prefix);
        }
        (self.default_agent().to_string(), text.to_string(), RouteMatch::Default)
    }

    /// Configured default agent.
    pub fn default_agent(&self) -> &'a str {
        let agents = &self.settings.agents;
        agents
            .default
            .as_deref()
            .or_else(|| agents.list.first().map(|a| a.id.as_str()))
            .unwrap_or(DEFAULT_AGENT_ID)
    }

    fn match_binding(&self, source: &MessageSource) -> Option<&'a str> {
        let mut best: Option<(u32, &'a AgentBinding)> = None;
        for binding in &self.settings.agents.bindings {
            let Some(score) = binding_score(binding, source) else {
                continue;
            };
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, binding));
            }
        }
        best.map(|(_, b)| b.agent_id.as_str())
    }

    fn match_prefix<'t>(&self, text: &'t str) -> Option<(&'a str, &'t str)> {
        let rest = text.trim_start().strip_prefix('/')?;
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let candidate = &rest[..end];
        let agent = self.settings.agents.get(candidate)?;
        Some((agent.id.as_str(), rest[end..].trim_start()))
    }

    /// Session key for a source served by `agent_id`.
    pub fn session_key(&self, source: &MessageSource, agent_id: &str) -> SessionKey {
        let channel = &source.channel;
        let account = source
            .account_id
            .as_deref()
            .map(|a| format!(":account:{a}"))
            .unwrap_or_default();

        let key = match source.chat_type {
            ChatType::Dm => match self.settings.session.dm_scope {
                DmScope::Main if account.is_empty() => format!("agent:{agent_id}:main"),
                DmScope::Main => format!("agent:{agent_id}:{channel}{account}:main"),
                DmScope::PerPeer if account.is_empty() => {
                    format!("agent:{agent_id}:dm:{}", source.sender_id)
                }
                DmScope::PerPeer | DmScope::PerChannelPeer => {
                    format!("agent:{agent_id}:{channel}{account}:dm:{}", source.sender_id)
                }
            },
            ChatType::Group => {
                let mut key = format!("agent:{agent_id}:{channel}{account}:group:{}", source.chat_id);
                if let Some(topic) = &source.topic_id {
                    key.push_str(&format!(":topic:{topic}"));
                }
                if let Some(thread) = &source.thread_id {
                    key.push_str(&format!(":thread:{thread}"));
                }
                key
            }
            ChatType::Channel => {
                let mut key = format!("agent:{agent_id}:{channel}{account}:channel:{}", source.chat_id);
                if let Some(thread) = source.thread_id.as_ref().or(source.topic_id.as_ref()) {
                    key.push_str(&format!(":thread:{thread}"));
                }
                key
            }
        };
        SessionKey::from(key)
    }

    /// Role for a source, most specific configuration first: guild channel,
    /// guild, topic, group, wildcard group, account, channel, agent, default.
    pub fn resolve_role(&self, source: &MessageSource, agent_id: &str) -> String {
        self.configured_role(source)
            .or_else(|| self.settings.agents.get(agent_id).and_then(|a| a.role.clone()))
            .unwrap_or_else(|| DEFAULT_ROLE.to_string())
    }

    fn configured_role(&self, source: &MessageSource) -> Option<String> {
        let channel = self.settings.channel(&source.channel)?;

        if let Some(guild) = source.guild_id.as_ref().and_then(|g| channel.guilds.get(g)) {
            if let Some(role) = guild.channels.get(&source.chat_id).and_then(|c| c.role.clone()) {
                return Some(role);
            }
            if guild.role.is_some() {
                return guild.role.clone();
            }
        }

        let account = source.account_id.as_ref().and_then(|a| channel.accounts.get(a));
        if source.chat_type == ChatType::Group {
            let groups = account.and_then(|a| a.groups.as_ref()).unwrap_or(&channel.groups);
            if let Some(role) = group_role(groups, source) {
                return Some(role);
            }
        }
        account
            .and_then(|a| a.role.clone())
            .or_else(|| channel.role.clone())
    }

    /// Working directory for a role. An agent's own workspace wins, then
    /// `roles.workspaceDirs`, then `<dataDir>/workspaces/<role>`.
    pub fn workspace_dir(&self, role: &str, agent_id: &str) -> PathBuf {
        if let Some(dir) = self.settings.agents.get(agent_id).and_then(|a| a.workspace.as_deref()) {
            return expand_home(dir);
        }
        if let Some(dir) = self.settings.roles.workspace_dirs.get(role) {
            return expand_home(dir);
        }
        expand_home(&self.settings.session.data_dir).join("workspaces").join(role)
    }

    /// Message mode configured for a source: account, then channel, then global.
    pub fn configured_mode(&self, source: &MessageSource) -> MessageMode {
        let channel = self.settings.channel(&source.channel);
        let account = channel.and_then(|c| source.account_id.as_ref().and_then(|a| c.accounts.get(a)));
        account
            .and_then(|a| a.message_mode)
            .or_else(|| channel.and_then(|c| c.message_mode))
            .unwrap_or(self.settings.agent.message_mode)
    }

    /// Whether the sender is on the channel allow list.
    pub fn is_allow_listed(&self, source: &MessageSource) -> bool {
        self.settings
            .channel(&source.channel)
            .is_some_and(|c| c.allow_from.iter().any(|s| s == &source.sender_id || s == "*"))
    }
}

fn group_role(groups: &std::collections::HashMap<String, GroupSettings>, source: &MessageSource) -> Option<String> {
    if let Some(group) = groups.get(&source.chat_id) {
        if let Some(role) = source
            .topic_id
            .as_ref()
            .and_then(|t| group.topics.get(t))
            .and_then(|t| t.role.clone())
        {
            return Some(role);
        }
        if group.role.is_some() {
            return group.role.clone();
        }
    }
    groups.get("*").and_then(|g| g.role.clone())
}

/// Score of a binding for a source, or `None` when any specified field fails
/// to match or nothing is specified.
fn binding_score(binding: &AgentBinding, source: &MessageSource) -> Option<u32> {
    let m = &binding.matcher;
    let mut score = 0;
    if let Some(channel) = &m.channel {
        if channel != &source.channel {
            return None;
        }
        score += 1;
    }
    if let Some(account) = &m.account_id {
        if source.account_id.as_ref() != Some(account) {
            return None;
        }
        score += 2;
    }
    if let Some(guild) = &m.guild_id {
        if source.guild_id.as_ref() != Some(guild) {
            return None;
        }
        score += 4;
    }
    if let Some(peer) = &m.peer {
        let kind_matches = match source.chat_type {
            ChatType::Dm => peer.kind == "dm" || peer.kind == "direct",
            ChatType::Group => peer.kind == "group",
            ChatType::Channel => peer.kind == "channel",
        };
        let id_matches = peer.id == source.chat_id || (source.is_dm() && peer.id == source.sender_id);
        if !kind_matches || !id_matches {
            return None;
        }
        score += 8;
    }
    (score > 0).then_some(score)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_settings::{
        AccountSettings, AgentDefinition, BindingMatch, ChannelSettings, GuildSettings, PeerMatch, TopicSettings,
    };

    fn agent(id: &str) -> AgentDefinition {
        AgentDefinition {
            id: id.into(),
            workspace: None,
            model: None,
            role: None,
        }
    }

    fn binding(agent_id: &str, matcher: BindingMatch) -> AgentBinding {
        AgentBinding {
            agent_id: agent_id.into(),
            matcher,
        }
    }

    fn group(chat_id: &str) -> MessageSource {
        MessageSource::group("telegram", chat_id, "u1")
    }

    #[test]
    fn dm_scopes() {
        let mut settings = GatewaySettings::default();
        let source = MessageSource::dm("telegram", "42");
        let router = SessionRouter::new(&settings);
        assert_eq!(router.session_key(&source, "main").as_str(), "agent:main:main");

        settings.session.dm_scope = DmScope::PerPeer;
        let router = SessionRouter::new(&settings);
        assert_eq!(router.session_key(&source, "main").as_str(), "agent:main:dm:42");

        settings.session.dm_scope = DmScope::PerChannelPeer;
        let router = SessionRouter::new(&settings);
        assert_eq!(router.session_key(&source, "main").as_str(), "agent:main:telegram:dm:42");
    }

    #[test]
    fn account_segment_in_keys() {
        let settings = GatewaySettings::default();
        let router = SessionRouter::new(&settings);
        let mut source = MessageSource::dm("telegram", "42");
        source.account_id = Some("work".into());
        assert_eq!(router.session_key(&source, "main").as_str(), "agent:main:telegram:account:work:main");

        let mut g = group("-100");
        g.account_id = Some("work".into());
        assert_eq!(
            router.session_key(&g, "main").as_str(),
            "agent:main:telegram:account:work:group:-100"
        );
    }

    #[test]
    fn forum_topic_is_distinct_from_parent_group() {
        let settings = GatewaySettings::default();
        let router = SessionRouter::new(&settings);
        let parent = group("-100");
        let mut topic = group("-100");
        topic.topic_id = Some("7".into());
        let parent_key = router.session_key(&parent, "main");
        let topic_key = router.session_key(&topic, "main");
        assert_ne!(parent_key, topic_key);
        assert_eq!(topic_key.as_str(), "agent:main:telegram:group:-100:topic:7");
        assert_eq!(topic_key.segment("topic"), Some("7"));
    }

    #[test]
    fn discord_thread_key() {
        let settings = GatewaySettings::default();
        let router = SessionRouter::new(&settings);
        let mut source = MessageSource::group("discord", "c1", "u1");
        source.chat_type = ChatType::Channel;
        source.thread_id = Some("t9".into());
        assert_eq!(
            router.session_key(&source, "main").as_str(),
            "agent:main:discord:channel:c1:thread:t9"
        );
    }

    #[test]
    fn binding_beats_prefix() {
        let mut settings = GatewaySettings::default();
        settings.agents.list = vec![agent("main"), agent("code"), agent("ops")];
        settings.agents.bindings = vec![binding(
            "ops",
            BindingMatch {
                peer: Some(PeerMatch {
                    kind: "dm".into(),
                    id: "42".into(),
                }),
                ..BindingMatch::default()
            },
        )];
        let router = SessionRouter::new(&settings);
        let source = MessageSource::dm("telegram", "42");
        let route = router.route(&source, "/code fix it", None);
        assert_eq!(route.agent_id, "ops");
        assert_eq!(route.matched_by, RouteMatch::Binding);
        assert_eq!(route.text, "/code fix it");

        let other = MessageSource::dm("telegram", "7");
        let route = router.route(&other, "/code fix it", None);
        assert_eq!(route.agent_id, "code");
        assert_eq!(route.text, "fix it");
        assert_eq!(route.session_key.as_str(), "agent:code:main");
    }

    #[test]
    fn most_specific_binding_wins() {
        let mut settings = GatewaySettings::default();
        settings.agents.bindings = vec![
            binding(
                "by-channel",
                BindingMatch {
                    channel: Some("discord".into()),
                    ..BindingMatch::default()
                },
            ),
            binding(
                "by-guild",
                BindingMatch {
                    channel: Some("discord".into()),
                    guild_id: Some("g1".into()),
                    ..BindingMatch::default()
                },
            ),
            binding(
                "other-account",
                BindingMatch {
                    account_id: Some("nope".into()),
                    ..BindingMatch::default()
                },
            ),
        ];
        let router = SessionRouter::new(&settings);
        let mut source = MessageSource::group("discord", "c1", "u1");
        source.guild_id = Some("g1".into());
        assert_eq!(router.resolve_agent(&source, "hi").0, "by-guild");
        source.guild_id = Some("g2".into());
        assert_eq!(router.resolve_agent(&source, "hi").0, "by-channel");
    }

    #[test]
    fn prefix_only_for_listed_agents() {
        let mut settings = GatewaySettings::default();
        settings.agents.list = vec![agent("main")];
        let router = SessionRouter::new(&settings);
        let (agent_id, text, matched) = router.resolve_agent(&MessageSource::dm("telegram", "1"), "/unknown hi");
        assert_eq!(agent_id, "main");
        assert_eq!(text, "/unknown hi");
        assert_eq!(matched, RouteMatch::Default);
    }

    #[test]
    fn explicit_key_is_kept() {
        let settings = GatewaySettings::default();
        let router = SessionRouter::new(&settings);
        let key = SessionKey::cron("nightly");
        let route = router.route(&MessageSource::dm("cron", "system"), "run", Some(&key));
        assert_eq!(route.session_key, key);
    }

    #[test]
    fn role_precedence() {
        let mut settings = GatewaySettings::default();
        let mut groups = std::collections::HashMap::new();
        let mut topics = std::collections::HashMap::new();
        let _ = topics.insert(
            "7".to_string(),
            TopicSettings {
                role: Some("topic-role".into()),
            },
        );
        let _ = groups.insert(
            "-100".to_string(),
            GroupSettings {
                role: Some("group-role".into()),
                topics,
            },
        );
        let _ = groups.insert(
            "*".to_string(),
            GroupSettings {
                role: Some("wildcard-role".into()),
                topics: std::collections::HashMap::new(),
            },
        );
        let mut accounts = std::collections::HashMap::new();
        let _ = accounts.insert(
            "work".to_string(),
            AccountSettings {
                role: Some("account-role".into()),
                ..AccountSettings::default()
            },
        );
        let _ = settings.channels.insert(
            "telegram".into(),
            ChannelSettings {
                role: Some("channel-role".into()),
                groups,
                accounts,
                ..ChannelSettings::default()
            },
        );
        let router = SessionRouter::new(&settings);

        let mut topic = group("-100");
        topic.topic_id = Some("7".into());
        assert_eq!(router.resolve_role(&topic, "main"), "topic-role");
        assert_eq!(router.resolve_role(&group("-100"), "main"), "group-role");
        assert_eq!(router.resolve_role(&group("-200"), "main"), "wildcard-role");

        let mut dm = MessageSource::dm("telegram", "1");
        dm.account_id = Some("work".into());
        assert_eq!(router.resolve_role(&dm, "main"), "account-role");
        assert_eq!(router.resolve_role(&MessageSource::dm("telegram", "1"), "main"), "channel-role");
        assert_eq!(router.resolve_role(&MessageSource::dm("slack", "1"), "main"), DEFAULT_ROLE);
    }

    #[test]
    fn guild_roles() {
        let mut settings = GatewaySettings::default();
        let mut guilds = std::collections::HashMap::new();
        let mut channels = std::collections::HashMap::new();
        let _ = channels.insert(
            "c1".to_string(),
            TopicSettings {
                role: Some("chan-role".into()),
            },
        );
        let _ = guilds.insert(
            "g1".to_string(),
            GuildSettings {
                role: Some("guild-role".into()),
                channels,
            },
        );
        let _ = settings.channels.insert(
            "discord".into(),
            ChannelSettings {
                guilds,
                ..ChannelSettings::default()
            },
        );
        let router = SessionRouter::new(&settings);
        let mut source = MessageSource::group("discord", "c1", "u1");
        source.guild_id = Some("g1".into());
        assert_eq!(router.resolve_role(&source, "main"), "chan-role");
        source.chat_id = "c2".into();
        assert_eq!(router.resolve_role(&source, "main"), "guild-role");
    }

    #[test]
    fn workspace_dirs() {
        let mut settings = GatewaySettings::default();
        settings.session.data_dir = "/data".into();
        let _ = settings.roles.workspace_dirs.insert("ops".into(), "/srv/ops".into());
        settings.agents.list = vec![AgentDefinition {
            workspace: Some("/agents/code".into()),
            ..agent("code")
        }];
        let router = SessionRouter::new(&settings);
        assert_eq!(router.workspace_dir("ops", "main"), PathBuf::from("/srv/ops"));
        assert_eq!(router.workspace_dir("default", "main"), PathBuf::from("/data/workspaces/default"));
        assert_eq!(router.workspace_dir("ops", "code"), PathBuf::from("/agents/code"));
    }

    #[test]
    fn configured_mode_precedence() {
        let mut settings = GatewaySettings::default();
        let mut accounts = std::collections::HashMap::new();
        let _ = accounts.insert(
            "work".to_string(),
            AccountSettings {
                message_mode: Some(MessageMode::Interrupt),
                ..AccountSettings::default()
            },
        );
        let _ = settings.channels.insert(
            "telegram".into(),
            ChannelSettings {
                message_mode: Some(MessageMode::FollowUp),
                accounts,
                allow_from: vec!["42".into()],
                ..ChannelSettings::default()
            },
        );
        let router = SessionRouter::new(&settings);
        let mut source = MessageSource::dm("telegram", "42");
        assert_eq!(router.configured_mode(&source), MessageMode::FollowUp);
        source.account_id = Some("work".into());
        assert_eq!(router.configured_mode(&source), MessageMode::Interrupt);
        assert_eq!(router.configured_mode(&MessageSource::dm("slack", "1")), MessageMode::Steer);
        assert!(router.is_allow_listed(&source));
        assert!(!router.is_allow_listed(&MessageSource::dm("telegram", "7")));
    }
}
