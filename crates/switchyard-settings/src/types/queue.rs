//! Queueing, dedup and backpressure settings.

use serde::{Deserialize, Serialize};

/// How queued messages for a busy session are turned into worker turns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Merge bursts into one prompt after a debounce window.
    #[default]
    Collect,
    /// One turn per message.
    Individual,
}

/// Queue and backpressure settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Pending entries allowed per session.
    pub max_per_session: usize,
    /// Pending entries allowed across all sessions.
    pub global_max_pending: usize,
    /// Collect or individual delivery.
    pub mode: QueueMode,
    /// Debounce window for collect mode.
    pub collect_debounce_ms: u64,
    /// Dropped-message summaries kept per session.
    pub max_dropped_summaries: usize,
    /// How long a turn may wait for a pool slot.
    pub pool_wait_ttl_ms: u64,
    /// Entries allowed in the pool waiting list.
    pub waiting_list_max: usize,
    /// Duplicate suppression.
    pub dedup: DedupSettings,
    /// Priority weights by source.
    pub priority: PrioritySettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_per_session: 15,
            global_max_pending: 100,
            mode: QueueMode::Collect,
            collect_debounce_ms: 1_500,
            max_dropped_summaries: 5,
            pool_wait_ttl_ms: 30_000,
            waiting_list_max: 50,
            dedup: DedupSettings::default(),
            priority: PrioritySettings::default(),
        }
    }
}

/// Duplicate suppression settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupSettings {
    /// Whether duplicate inbound deliveries are dropped.
    pub enabled: bool,
    /// Fingerprints remembered.
    pub cache_size: usize,
    /// How long a fingerprint counts as seen.
    pub ttl_ms: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_size: 1_000,
            ttl_ms: 60_000,
        }
    }
}

/// Priority weights used for cross-session tie-breaks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrioritySettings {
    /// Direct messages.
    pub dm: i32,
    /// Group and channel messages.
    pub group: i32,
    /// Webhook-originated messages.
    pub webhook: i32,
    /// Added when the sender is on the channel allow list.
    pub allowlist_bonus: i32,
}

impl Default for PrioritySettings {
    fn default() -> Self {
        Self {
            dm: 10,
            group: 5,
            webhook: 3,
            allowlist_bonus: 2,
        }
    }
}
