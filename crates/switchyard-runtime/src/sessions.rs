//! Session registry.
//!
//! Runtime state per conversation: role, whether a turn is streaming, the
//! bound worker, counters and the message-mode override set by control
//! commands. Entries appear on the first message of a session and leave on
//! session end; a rename moves an entry to a new key untouched.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use switchyard_core::{SessionKey, WorkerId};
use switchyard_settings::MessageMode;
use tracing::{debug, info};

/// Runtime state of one session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Session key.
    pub session_key: SessionKey,
    /// Agent serving the session.
    pub agent_id: String,
    /// Role of the worker profile.
    pub role: String,
    /// Channel of the last message.
    pub channel: String,
    /// A turn is in flight.
    pub streaming: bool,
    /// Worker serving the current turn.
    pub worker_id: Option<WorkerId>,
    /// Messages received.
    pub message_count: u64,
    /// Mode set at runtime, overriding configuration.
    pub mode_override: Option<MessageMode>,
    /// First message.
    pub created_at: DateTime<Utc>,
    /// Last message or turn boundary.
    pub last_activity: DateTime<Utc>,
}

/// Concurrent map of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, SessionState>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound message. Returns `true` when the session is new.
    pub fn touch(&self, session_key: &SessionKey, agent_id: &str, role: &str, channel: &str) -> bool {
        let now = Utc::now();
        let mut created = false;
        let mut entry = self.sessions.entry(session_key.clone()).or_insert_with(|| {
            created = true;
            SessionState {
                session_key: session_key.clone(),
                agent_id: agent_id.to_string(),
                role: role.to_string(),
                channel: channel.to_string(),
                streaming: false,
                worker_id: None,
                message_count: 0,
                mode_override: None,
                created_at: now,
                last_activity: now,
            }
        });
        entry.message_count += 1;
        entry.last_activity = now;
        entry.role = role.to_string();
        entry.channel = channel.to_string();
        if created {
            debug!(session_key = %session_key, agent_id, role, "session created");
        }
        created
    }

    /// Mark a turn as started or finished.
    pub fn set_streaming(&self, session_key: &SessionKey, streaming: bool, worker_id: Option<WorkerId>) {
        if let Some(mut entry) = self.sessions.get_mut(session_key) {
            entry.streaming = streaming;
            entry.worker_id = worker_id;
            entry.last_activity = Utc::now();
        }
    }

    /// Whether a turn is streaming.
    pub fn is_streaming(&self, session_key: &SessionKey) -> bool {
        self.sessions.get(session_key).is_some_and(|e| e.streaming)
    }

    /// Set or clear the runtime mode override.
    pub fn set_mode_override(&self, session_key: &SessionKey, mode: Option<MessageMode>) -> bool {
        match self.sessions.get_mut(session_key) {
            Some(mut entry) => {
                entry.mode_override = mode;
                info!(session_key = %session_key, mode = mode.map(MessageMode::as_str), "message mode override");
                true
            }
            None => false,
        }
    }

    /// Runtime mode override.
    pub fn mode_override(&self, session_key: &SessionKey) -> Option<MessageMode> {
        self.sessions.get(session_key).and_then(|e| e.mode_override)
    }

    /// Copy of a session's state.
    pub fn get(&self, session_key: &SessionKey) -> Option<SessionState> {
        self.sessions.get(session_key).map(|e| e.clone())
    }

    /// Forget a session.
    pub fn remove(&self, session_key: &SessionKey) -> Option<SessionState> {
        self.sessions.remove(session_key).map(|(_, state)| state)
    }

    /// Move a session to a new key, keeping its state. Fails when the old key
    /// is unknown or the new one is taken.
    pub fn rename(&self, old: &SessionKey, new: &SessionKey) -> bool {
        if self.sessions.contains_key(new) {
            return false;
        }
        let Some((_, mut state)) = self.sessions.remove(old) else {
            return false;
        };
        state.session_key = new.clone();
        let _ = self.sessions.insert(new.clone(), state);
        info!(from = %old, to = %new, "session renamed");
        true
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All sessions, most recently active first.
    pub fn list(&self) -> Vec<SessionState> {
        let mut all: Vec<SessionState> = self.sessions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        all
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
