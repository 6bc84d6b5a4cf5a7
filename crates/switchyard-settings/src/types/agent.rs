//! Worker invocation settings: executable, model, resources, pool bounds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a message arriving while the session's worker is mid-turn is handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageMode {
    /// Inject into the in-flight turn.
    #[default]
    Steer,
    /// Queue as the next turn.
    FollowUp,
    /// Abort the in-flight turn and queue as a fresh turn.
    Interrupt,
}

impl MessageMode {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Steer => "steer",
            Self::FollowUp => "follow-up",
            Self::Interrupt => "interrupt",
        }
    }
}

impl std::str::FromStr for MessageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "steer" => Ok(Self::Steer),
            "follow-up" | "followUp" | "followup" => Ok(Self::FollowUp),
            "interrupt" => Ok(Self::Interrupt),
            other => Err(format!("unknown message mode: {other}")),
        }
    }
}

/// Worker invocation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Worker executable (resolved through `PATH` when not absolute).
    pub executable: String,
    /// Default model as `provider/model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Thinking level passed to the worker (`off` disables the flag).
    pub thinking_level: String,
    /// Per-turn timeout in milliseconds.
    pub timeout_ms: u64,
    /// How long a timed-out turn may take to acknowledge its abort before
    /// the worker is stopped.
    pub abort_grace_ms: u64,
    /// Default mode for messages arriving mid-turn.
    pub message_mode: MessageMode,
    /// Replacement system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Text appended to the worker's system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
    /// Legacy single skill list, used only when no layered list is set.
    pub skills: Vec<String>,
    /// Base skill layer (lowest precedence).
    pub skills_base: Vec<String>,
    /// Gateway-wide skill layer.
    pub skills_gateway: Vec<String>,
    /// Gateway-wide extensions.
    pub extensions: Vec<String>,
    /// Gateway-wide prompt templates.
    pub prompt_templates: Vec<String>,
    /// Disable the worker's own extension discovery.
    pub no_extensions: bool,
    /// Disable the worker's own skill discovery.
    pub no_skills: bool,
    /// Disable the worker's own prompt template discovery.
    pub no_prompt_templates: bool,
    /// Tool allow/deny lists.
    pub tools: ToolPolicy,
    /// Worker runtime directories exported through the environment.
    pub runtime: RuntimeDirs,
    /// Extra environment variables for every worker.
    pub env: BTreeMap<String, String>,
    /// Pool bounds and timings.
    pub pool: PoolSettings,
    /// Model fallback chain and cooldowns.
    pub model_failover: ModelFailoverSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            executable: "pi".to_string(),
            model: None,
            thinking_level: "off".to_string(),
            timeout_ms: 120_000,
            abort_grace_ms: 5_000,
            message_mode: MessageMode::Steer,
            system_prompt: None,
            append_system_prompt: None,
            skills: Vec::new(),
            skills_base: Vec::new(),
            skills_gateway: Vec::new(),
            extensions: Vec::new(),
            prompt_templates: Vec::new(),
            no_extensions: false,
            no_skills: false,
            no_prompt_templates: false,
            tools: ToolPolicy::default(),
            runtime: RuntimeDirs::default(),
            env: BTreeMap::new(),
            pool: PoolSettings::default(),
            model_failover: ModelFailoverSettings::default(),
        }
    }
}

/// Tool allow/deny lists forwarded to the worker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolPolicy {
    /// Only these tools are enabled (empty = worker default).
    pub allow: Vec<String>,
    /// These tools are disabled.
    pub deny: Vec<String>,
}

/// Worker runtime directories.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeDirs {
    /// Exported as `WORKER_AGENT_DIR`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_dir: Option<String>,
    /// Exported as `WORKER_PACKAGE_DIR`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_dir: Option<String>,
}

/// Pool bounds and timings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Workers kept warm at steady state.
    pub min: usize,
    /// Hard cap on live workers.
    pub max: usize,
    /// Idle workers above `min` are stopped after this long.
    pub idle_timeout_ms: u64,
    /// Health check / reclamation interval.
    pub maintenance_interval_ms: u64,
    /// Timeout for a single command round-trip.
    pub request_timeout_ms: u64,
    /// A worker exiting within this window after spawn is a spawn failure.
    pub startup_grace_ms: u64,
    /// Time allowed for a graceful exit before the worker is killed.
    pub stop_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            idle_timeout_ms: 300_000,
            maintenance_interval_ms: 30_000,
            request_timeout_ms: 30_000,
            startup_grace_ms: 200,
            stop_grace_ms: 2_000,
        }
    }
}

/// Model fallback chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelFailoverSettings {
    /// Primary model (`provider/model`). Defaults to `agent.model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    /// Fallbacks tried in order while earlier models cool down.
    pub fallbacks: Vec<String>,
    /// Consecutive transient failures that put a model into cooldown.
    pub failure_threshold: u32,
    /// Cooldown after transient failures.
    pub cooldown_ms: u64,
    /// Cooldown after auth or billing failures.
    pub permanent_cooldown_ms: u64,
}

impl Default for ModelFailoverSettings {
    fn default() -> Self {
        Self {
            primary: None,
            fallbacks: Vec::new(),
            failure_threshold: 1,
            cooldown_ms: 60_000,
            permanent_cooldown_ms: 3_600_000,
        }
    }
}

impl AgentSettings {
    /// `[primary, ...fallbacks]`, empty when no model is configured.
    pub fn model_chain(&self) -> Vec<String> {
        let primary = self
            .model_failover
            .primary
            .clone()
            .or_else(|| self.model.clone());
        primary
            .into_iter()
            .chain(self.model_failover.fallbacks.iter().cloned())
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_mode_kebab_case() {
        let mode: MessageMode = serde_json::from_str("\"follow-up\"").unwrap();
        assert_eq!(mode, MessageMode::FollowUp);
        assert_eq!(serde_json::to_string(&MessageMode::Interrupt).unwrap(), "\"interrupt\"");
        assert_eq!("followUp".parse::<MessageMode>().unwrap(), MessageMode::FollowUp);
        assert!("bogus".parse::<MessageMode>().is_err());
    }

    #[test]
    fn model_chain_prefers_failover_primary() {
        let mut agent = AgentSettings {
            model: Some("a/one".into()),
            ..AgentSettings::default()
        };
        agent.model_failover.fallbacks = vec!["b/two".into()];
        assert_eq!(agent.model_chain(), vec!["a/one", "b/two"]);

        agent.model_failover.primary = Some("c/three".into());
        assert_eq!(agent.model_chain(), vec!["c/three", "b/two"]);
    }

    #[test]
    fn model_chain_empty_without_model() {
        assert!(AgentSettings::default().model_chain().is_empty());
    }
}
