//! Inbound deduplication.
//!
//! Webhook retries and reconnect replays deliver the same message twice.
//! [`DeduplicationCache`] remembers a fingerprint of each accepted message
//! (sender, channel and a SHA-256 of the first 256 characters of text) for a
//! TTL window. The cache is bounded: expired entries go first, then the
//! least recently recorded.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use switchyard_core::MessageSource;
use switchyard_core::metrics::DEDUP_HITS_TOTAL;
use switchyard_settings::DedupSettings;
use tokio::time::Instant;
use tracing::debug;

/// Characters of text that take part in the fingerprint.
const FINGERPRINT_CHARS: usize = 256;

#[derive(Default)]
struct DedupState {
    seen: HashMap<String, Instant>,
    /// Recording order, oldest first. May hold superseded entries.
    order: VecDeque<(String, Instant)>,
}

/// Bounded, time-windowed set of recently seen messages.
pub struct DeduplicationCache {
    enabled: bool,
    capacity: usize,
    ttl: Duration,
    state: Mutex<DedupState>,
}

impl DeduplicationCache {
    /// Cache with explicit bounds.
    pub fn new(enabled: bool, capacity: usize, ttl: Duration) -> Self {
        Self {
            enabled,
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(DedupState::default()),
        }
    }

    /// Cache from settings.
    pub fn from_settings(settings: &DedupSettings) -> Self {
        Self::new(settings.enabled, settings.cache_size, Duration::from_millis(settings.ttl_ms))
    }

    /// Fingerprint of a message.
    pub fn fingerprint(source: &MessageSource, text: &str) -> String {
        let head: String = text.chars().take(FINGERPRINT_CHARS).collect();
        let digest = Sha256::digest(head.as_bytes());
        format!("{}:{}:{:x}", source.sender_id, source.channel, digest)
    }

    /// Whether the message was seen within the TTL. Records it when not.
    pub fn check_and_record(&self, source: &MessageSource, text: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let fingerprint = Self::fingerprint(source, text);
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(&at) = state.seen.get(&fingerprint) {
            if now.saturating_duration_since(at) < self.ttl {
                counter!(DEDUP_HITS_TOTAL).increment(1);
                debug!(sender_id = %source.sender_id, channel = %source.channel, "duplicate message dropped");
                return true;
            }
        }

        let _ = state.seen.insert(fingerprint.clone(), now);
        state.order.push_back((fingerprint, now));
        if state.seen.len() > self.capacity {
            self.evict(&mut state, now);
        }
        false
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, state: &mut DedupState, now: Instant) {
        let ttl = self.ttl;
        state.seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);
        while state.seen.len() > self.capacity {
            let Some((fingerprint, at)) = state.order.pop_front() else {
                break;
            };
            // Skip order entries superseded by a later record
            if state.seen.get(&fingerprint) == Some(&at) {
                let _ = state.seen.remove(&fingerprint);
            }
        }
        let DedupState { seen, order } = state;
        order.retain(|(fp, at)| seen.get(fp) == Some(at));
    }
}

impl std::fmt::Debug for DeduplicationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationCache")
            .field("enabled", &self.enabled)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
