//! Per-session message queue.
//!
//! Work for one session is strictly serial: at most one drain task runs per
//! session, and it hands entries to the [`TurnProcessor`] in arrival order.
//! Different sessions drain concurrently.
//!
//! Two caps bound memory. A session holding `max_per_session` entries rejects
//! new ones. Once `global_max_pending` entries are pending across all
//! sessions, a new entry is admitted only by evicting the lowest-priority
//! (then oldest) pending entry, and only if the newcomer's priority is
//! strictly higher. Rejected and evicted messages leave a one-line summary
//! that rides along with that session's next prompt.
//!
//! In collect mode, entries arriving within the debounce window (or while a
//! turn is running) are merged into one prompt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use switchyard_core::metrics::{QUEUE_COLLECT_MERGES_TOTAL, QUEUE_DROPS_TOTAL, QUEUE_PENDING};
use switchyard_core::{ImageContent, InboundMessage, SessionKey};
use switchyard_settings::{QueueMode, QueueSettings};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::QueueError;

const SUMMARY_CHARS: usize = 140;
const RATE_WINDOW: Duration = Duration::from_secs(10);

/// Queue tuning, derived from [`QueueSettings`].
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Pending entries allowed per session.
    pub max_per_session: usize,
    /// Pending entries allowed across all sessions.
    pub global_max_pending: usize,
    /// Collect or individual delivery.
    pub mode: QueueMode,
    /// Debounce window in collect mode.
    pub collect_debounce: Duration,
    /// Dropped summaries rendered per prompt.
    pub max_dropped_summaries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

impl QueueConfig {
    /// Build from the `queue` settings section.
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_per_session: settings.max_per_session.max(1),
            global_max_pending: settings.global_max_pending.max(1),
            mode: settings.mode,
            collect_debounce: Duration::from_millis(settings.collect_debounce_ms),
            max_dropped_summaries: settings.max_dropped_summaries,
        }
    }
}

/// One routed inbound message waiting for its turn.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    /// Session the entry belongs to.
    pub session_key: SessionKey,
    /// Agent serving the session.
    pub agent_id: String,
    /// Routed text (agent prefix stripped).
    pub text: String,
    /// Original message, carrying the responder.
    pub message: InboundMessage,
    /// Cross-session priority. Higher wins.
    pub priority: i32,
    /// Admission time.
    pub enqueued_at: Instant,
}

impl QueueEntry {
    /// Entry for `message`, stamped now.
    pub fn new(
        session_key: SessionKey,
        agent_id: impl Into<String>,
        text: impl Into<String>,
        message: InboundMessage,
        priority: i32,
    ) -> Self {
        Self {
            session_key,
            agent_id: agent_id.into(),
            text: text.into(),
            message,
            priority,
            enqueued_at: Instant::now(),
        }
    }

    fn summary(&self) -> String {
        let mut chars = self.text.chars();
        let head: String = chars.by_ref().take(SUMMARY_CHARS).collect();
        let ellipsis = if chars.next().is_some() { "..." } else { "" };
        format!("[Dropped] {head}{ellipsis}")
    }
}

/// A unit of work handed to the [`TurnProcessor`]: one or more entries of a
/// session folded into a single prompt.
#[derive(Clone, Debug)]
pub struct TurnBatch {
    /// Session.
    pub session_key: SessionKey,
    /// Entries, oldest first. Never empty.
    pub entries: Vec<QueueEntry>,
    /// Prompt to send to the worker.
    pub prompt: String,
    /// Images of every entry, in order.
    pub images: Vec<ImageContent>,
}

impl TurnBatch {
    /// Entry whose responder receives the reply.
    pub fn reply_to(&self) -> &QueueEntry {
        // entries is never empty
        &self.entries[self.entries.len() - 1]
    }

    /// Whether several messages were merged.
    pub fn is_merged(&self) -> bool {
        self.entries.len() > 1
    }
}

/// Runs one turn for a batch. Called by the session's drain task; the next
/// batch of that session is not handed out until this returns.
#[async_trait]
pub trait TurnProcessor: Send + Sync + 'static {
    /// Process the batch to completion, replying through its responder.
    async fn process(&self, batch: TurnBatch);
}

/// Per-session queue counters.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQueueStats {
    /// Session.
    pub session_key: SessionKey,
    /// Entries waiting.
    pub pending: usize,
    /// Whether a drain task is running.
    pub processing: bool,
}

/// Queue-wide counters.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Sessions with a queue.
    pub sessions: usize,
    /// Entries pending across all sessions.
    pub total_pending: usize,
    /// Entries rejected or evicted by the caps.
    pub drop_count: u64,
    /// Collect-mode merges.
    pub collect_merges: u64,
    /// Admissions per second over the last 10 seconds.
    pub enqueue_rate: f64,
    /// Per-session detail.
    pub details: Vec<SessionQueueStats>,
}

#[derive(Default)]
struct SessionQueue {
    pending: VecDeque<(u64, QueueEntry)>,
    processing: bool,
    debounce: Option<JoinHandle<()>>,
    dropped: VecDeque<String>,
    dropped_overflow: usize,
}

impl SessionQueue {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.processing && self.debounce.is_none()
    }

    fn record_dropped(&mut self, entry: &QueueEntry, keep: usize) {
        self.dropped.push_back(entry.summary());
        while self.dropped.len() > keep {
            let _ = self.dropped.pop_front();
            self.dropped_overflow += 1;
        }
    }

    fn take_dropped(&mut self) -> (Vec<String>, usize) {
        let overflow = std::mem::take(&mut self.dropped_overflow);
        (self.dropped.drain(..).collect(), overflow)
    }
}

#[derive(Default)]
struct QueueState {
    sessions: HashMap<SessionKey, SessionQueue>,
    next_seq: u64,
    enqueue_times: VecDeque<Instant>,
    drop_count: u64,
    collect_merges: u64,
}

impl QueueState {
    fn total_pending(&self) -> usize {
        self.sessions.values().map(|q| q.pending.len()).sum()
    }

    fn publish(&self) {
        gauge!(QUEUE_PENDING).set(self.total_pending() as f64);
    }

    /// Lowest-priority, oldest pending entry across all sessions.
    fn lowest(&self) -> Option<(SessionKey, u64, i32)> {
        self.sessions
            .iter()
            .flat_map(|(key, q)| q.pending.iter().map(move |(seq, e)| (key, *seq, e.priority)))
            .min_by_key(|(_, seq, priority)| (*priority, *seq))
            .map(|(key, seq, priority)| (key.clone(), seq, priority))
    }

    fn trim_rate_window(&mut self, now: Instant) {
        while self
            .enqueue_times
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
        {
            let _ = self.enqueue_times.pop_front();
        }
    }
}

struct QueueInner {
    config: RwLock<QueueConfig>,
    state: Mutex<QueueState>,
    processor: Weak<dyn TurnProcessor>,
}

/// Serializes work per session and bounds pending work.
#[derive(Clone)]
pub struct MessageQueueManager {
    inner: Arc<QueueInner>,
}

impl MessageQueueManager {
    /// Queue delivering batches to `processor`. The queue only holds a weak
    /// reference, so the processor may own the queue.
    pub fn new(config: QueueConfig, processor: Weak<dyn TurnProcessor>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config: RwLock::new(config),
                state: Mutex::new(QueueState::default()),
                processor,
            }),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> QueueConfig {
        self.inner.config.read().clone()
    }

    /// Swap in new tuning. Pending entries stay; caps apply to new admissions.
    pub fn reconfigure(&self, config: QueueConfig) {
        *self.inner.config.write() = config;
    }

    /// Admit an entry and schedule its session's drain.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let config = self.config();
        let session_key = entry.session_key.clone();
        let mut state = self.inner.state.lock();

        let session_pending = state.sessions.get(&session_key).map_or(0, |q| q.pending.len());
        if session_pending >= config.max_per_session {
            state.drop_count += 1;
            counter!(QUEUE_DROPS_TOTAL, "reason" => "session_cap").increment(1);
            if let Some(queue) = state.sessions.get_mut(&session_key) {
                queue.record_dropped(&entry, config.max_dropped_summaries);
            }
            warn!(session_key = %session_key, max = config.max_per_session, "session queue full, rejecting message");
            return Err(QueueError::SessionFull {
                session_key,
                max: config.max_per_session,
            });
        }

        if state.total_pending() >= config.global_max_pending {
            match state.lowest() {
                Some((victim_key, seq, priority)) if priority < entry.priority => {
                    if let Some(queue) = state.sessions.get_mut(&victim_key) {
                        if let Some(pos) = queue.pending.iter().position(|(s, _)| *s == seq) {
                            if let Some((_, victim)) = queue.pending.remove(pos) {
                                queue.record_dropped(&victim, config.max_dropped_summaries);
                            }
                        }
                    }
                    state.drop_count += 1;
                    counter!(QUEUE_DROPS_TOTAL, "reason" => "global_evict").increment(1);
                    info!(
                        victim = %victim_key,
                        victim_priority = priority,
                        priority = entry.priority,
                        "evicted lower-priority entry to admit message"
                    );
                }
                _ => {
                    state.drop_count += 1;
                    counter!(QUEUE_DROPS_TOTAL, "reason" => "global_cap").increment(1);
                    warn!(session_key = %session_key, priority = entry.priority, "global queue cap reached, rejecting message");
                    return Err(QueueError::GlobalFull {
                        max: config.global_max_pending,
                    });
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let now = Instant::now();
        state.enqueue_times.push_back(now);
        state.trim_rate_window(now);

        let queue = state.sessions.entry(session_key.clone()).or_default();
        queue.pending.push_back((seq, entry));
        debug!(session_key = %session_key, pending = queue.pending.len(), "enqueued");

        if !queue.processing {
            match config.mode {
                QueueMode::Individual => {
                    queue.processing = true;
                    let _ = tokio::spawn(drain(Arc::clone(&self.inner), session_key));
                }
                QueueMode::Collect => {
                    if let Some(timer) = queue.debounce.take() {
                        timer.abort();
                    }
                    let inner = Arc::clone(&self.inner);
                    let debounce = config.collect_debounce;
                    queue.debounce = Some(tokio::spawn(async move {
                        tokio::time::sleep(debounce).await;
                        let start = {
                            let mut state = inner.state.lock();
                            match state.sessions.get_mut(&session_key) {
                                Some(queue) if !queue.processing => {
                                    queue.debounce = None;
                                    queue.processing = true;
                                    true
                                }
                                _ => false,
                            }
                        };
                        if start {
                            drain(inner, session_key).await;
                        }
                    }));
                }
            }
        }
        state.publish();
        Ok(())
    }

    /// Discard a session's pending entries, debounce timer and dropped
    /// summaries. A turn already handed to the processor is unaffected.
    pub fn clear_collect_buffer(&self, session_key: &SessionKey) -> usize {
        let mut state = self.inner.state.lock();
        let Some(queue) = state.sessions.get_mut(session_key) else {
            return 0;
        };
        if let Some(timer) = queue.debounce.take() {
            timer.abort();
        }
        let cleared = queue.pending.len();
        queue.pending.clear();
        let _ = queue.take_dropped();
        state.publish();
        if cleared > 0 {
            info!(session_key = %session_key, cleared, "cleared collect buffer");
        }
        cleared
    }

    /// Entries pending for a session.
    pub fn pending(&self, session_key: &SessionKey) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .get(session_key)
            .map_or(0, |q| q.pending.len())
    }

    /// Whether a session's drain task is running.
    pub fn is_processing(&self, session_key: &SessionKey) -> bool {
        self.inner
            .state
            .lock()
            .sessions
            .get(session_key)
            .is_some_and(|q| q.processing)
    }

    /// Entries pending across all sessions.
    pub fn total_pending(&self) -> usize {
        self.inner.state.lock().total_pending()
    }

    /// Move a session's queue to a new key. Fails if the new key already
    /// has a queue.
    pub fn rename(&self, old: &SessionKey, new: &SessionKey) -> bool {
        let mut state = self.inner.state.lock();
        if state.sessions.contains_key(new) {
            return false;
        }
        let Some(mut queue) = state.sessions.remove(old) else {
            return false;
        };
        if queue.processing || queue.debounce.is_some() {
            // A running drain still looks the session up by its old key
            let _ = state.sessions.insert(old.clone(), queue);
            return false;
        }
        for (_, entry) in &mut queue.pending {
            entry.session_key = new.clone();
        }
        let _ = state.sessions.insert(new.clone(), queue);
        true
    }

    /// Counters for monitoring.
    pub fn stats(&self) -> QueueStats {
        let mut state = self.inner.state.lock();
        state.trim_rate_window(Instant::now());
        let details: Vec<SessionQueueStats> = state
            .sessions
            .iter()
            .map(|(key, q)| SessionQueueStats {
                session_key: key.clone(),
                pending: q.pending.len(),
                processing: q.processing,
            })
            .collect();
        QueueStats {
            sessions: state.sessions.len(),
            total_pending: state.total_pending(),
            drop_count: state.drop_count,
            collect_merges: state.collect_merges,
            enqueue_rate: state.enqueue_times.len() as f64 / RATE_WINDOW.as_secs_f64(),
            details,
        }
    }

    /// Forget idle sessions with nothing pending. Returns how many.
    pub fn cleanup(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.sessions.len();
        state.sessions.retain(|_, q| !q.is_idle());
        before - state.sessions.len()
    }

    /// Cancel every debounce timer and drop all pending entries.
    pub fn shutdown(&self) -> usize {
        let mut state = self.inner.state.lock();
        let mut dropped = 0;
        for queue in state.sessions.values_mut() {
            if let Some(timer) = queue.debounce.take() {
                timer.abort();
            }
            dropped += queue.pending.len();
            queue.pending.clear();
        }
        state.publish();
        dropped
    }
}

impl std::fmt::Debug for MessageQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueueManager")
            .field("config", &*self.inner.config.read())
            .finish_non_exhaustive()
    }
}

/// Drain a session until it has nothing pending. The caller has already set
/// `processing`.
async fn drain(inner: Arc<QueueInner>, session_key: SessionKey) {
    loop {
        let batch = {
            let config = inner.config.read().clone();
            let mut state = inner.state.lock();
            let Some(queue) = state.sessions.get_mut(&session_key) else {
                return;
            };
            if queue.pending.is_empty() {
                queue.processing = false;
                return;
            }
            let entries: Vec<QueueEntry> = match config.mode {
                QueueMode::Individual => queue.pending.pop_front().into_iter().map(|(_, e)| e).collect(),
                QueueMode::Collect => queue.pending.drain(..).map(|(_, e)| e).collect(),
            };
            let dropped = queue.take_dropped();
            let merged = entries.len() > 1;
            if merged {
                state.collect_merges += 1;
                counter!(QUEUE_COLLECT_MERGES_TOTAL).increment(1);
            }
            state.publish();
            build_batch(&session_key, entries, &dropped)
        };

        let Some(processor) = inner.processor.upgrade() else {
            warn!(session_key = %session_key, "turn processor gone, abandoning queue");
            if let Some(queue) = inner.state.lock().sessions.get_mut(&session_key) {
                queue.processing = false;
            }
            return;
        };
        if batch.is_merged() {
            info!(session_key = %session_key, merged = batch.entries.len(), "collect merged messages");
        }
        processor.process(batch).await;
    }
}

fn build_batch(session_key: &SessionKey, entries: Vec<QueueEntry>, dropped: &(Vec<String>, usize)) -> TurnBatch {
    let (summaries, overflow) = dropped;
    let prompt = if entries.len() == 1 {
        let mut prompt = entries[0].text.clone();
        if !summaries.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&dropped_section(summaries, *overflow));
        }
        prompt
    } else {
        collect_prompt(&entries, summaries, *overflow)
    };
    let images = entries
        .iter()
        .flat_map(|e| e.message.images.iter().cloned())
        .collect();
    TurnBatch {
        session_key: session_key.clone(),
        entries,
        prompt,
        images,
    }
}

/// Merge several messages into one prompt. `dropped` holds the summaries to
/// render and `overflow` how many older ones were discarded.
pub fn collect_prompt(entries: &[QueueEntry], dropped: &[String], overflow: usize) -> String {
    let mut lines: Vec<String> = vec!["[Queued messages while agent was busy]".into(), String::new()];
    for (i, entry) in entries.iter().enumerate() {
        lines.push("---".into());
        let image_tag = if entry.message.images.is_empty() { "" } else { " (with image)" };
        lines.push(format!("Queued #{}{image_tag}", i + 1));
        lines.push(if entry.text.is_empty() {
            "(no text)".into()
        } else {
            entry.text.clone()
        });
        lines.push(String::new());
    }
    if !dropped.is_empty() {
        lines.push(dropped_section(dropped, overflow));
    }
    lines.join("\n")
}

fn dropped_section(dropped: &[String], overflow: usize) -> String {
    let mut lines = vec!["---".to_string(), "[Dropped messages (summarized)]".to_string()];
    lines.extend(dropped.iter().cloned());
    if overflow > 0 {
        lines.push(format!("(and {overflow} more dropped)"));
    }
    lines.join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use switchyard_core::MessageSource;
    use switchyard_core::message::testing::RecordingResponder;
    use tokio::sync::{Notify, mpsc};

    /// Records batches; optionally blocks each turn until released.
    struct Recorder {
        tx: mpsc::UnboundedSender<TurnBatch>,
        gate: Option<Arc<Notify>>,
        active: Mutex<HashMap<SessionKey, usize>>,
        overlaps: Mutex<usize>,
    }

    #[async_trait]
    impl TurnProcessor for Recorder {
        async fn process(&self, batch: TurnBatch) {
            let key = batch.session_key.clone();
            {
                let mut active = self.active.lock();
                let n = active.entry(key.clone()).or_default();
                *n += 1;
                if *n > 1 {
                    *self.overlaps.lock() += 1;
                }
            }
            let _ = self.tx.send(batch);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            *self.active.lock().entry(key).or_default() -= 1;
        }
    }

    fn recorder(gate: Option<Arc<Notify>>) -> (Arc<Recorder>, mpsc::UnboundedReceiver<TurnBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            tx,
            gate,
            active: Mutex::new(HashMap::new()),
            overlaps: Mutex::new(0),
        });
        (recorder, rx)
    }

    fn manager(config: QueueConfig, processor: &Arc<Recorder>) -> MessageQueueManager {
        let weak: Weak<dyn TurnProcessor> = Arc::downgrade(processor) as Weak<dyn TurnProcessor>;
        MessageQueueManager::new(config, weak)
    }

    fn individual() -> QueueConfig {
        QueueConfig {
            mode: QueueMode::Individual,
            ..QueueConfig::default()
        }
    }

    fn entry(key: &str, text: &str, priority: i32) -> QueueEntry {
        let message = InboundMessage::new(
            MessageSource::dm("test", "u1"),
            text,
            Arc::new(RecordingResponder::default()),
        );
        QueueEntry::new(SessionKey::from(key), "main", text, message, priority)
    }

    #[tokio::test]
    async fn individual_mode_runs_each_entry_in_order() {
        let (processor, mut rx) = recorder(None);
        let queue = manager(individual(), &processor);
        for text in ["one", "two", "three"] {
            queue.enqueue(entry("s", text, 5)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().prompt);
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(*processor.overlaps.lock(), 0);
    }

    #[tokio::test]
    async fn one_turn_at_a_time_per_session() {
        let gate = Arc::new(Notify::new());
        let (processor, mut rx) = recorder(Some(Arc::clone(&gate)));
        let queue = manager(individual(), &processor);

        queue.enqueue(entry("s", "first", 5)).unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.prompt, "first");

        queue.enqueue(entry("s", "second", 5)).unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.pending(&SessionKey::from("s")), 1);
        assert!(queue.is_processing(&SessionKey::from("s")));

        gate.notify_one();
        assert_eq!(rx.recv().await.unwrap().prompt, "second");
        gate.notify_one();
        assert_eq!(*processor.overlaps.lock(), 0);
    }

    #[tokio::test]
    async fn sessions_progress_independently() {
        let gate = Arc::new(Notify::new());
        let (processor, mut rx) = recorder(Some(Arc::clone(&gate)));
        let queue = manager(individual(), &processor);
        queue.enqueue(entry("a", "from a", 5)).unwrap();
        queue.enqueue(entry("b", "from b", 5)).unwrap();
        let mut prompts = vec![rx.recv().await.unwrap().prompt, rx.recv().await.unwrap().prompt];
        prompts.sort();
        assert_eq!(prompts, vec!["from a", "from b"]);
        gate.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn collect_mode_merges_a_burst() {
        let (processor, mut rx) = recorder(None);
        let queue = manager(QueueConfig::default(), &processor);
        queue.enqueue(entry("s", "hello", 5)).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        queue.enqueue(entry("s", "are you there", 5)).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert!(batch.prompt.starts_with("[Queued messages while agent was busy]"));
        assert!(batch.prompt.contains("Queued #1\nhello"));
        assert!(batch.prompt.contains("Queued #2\nare you there"));
        assert_eq!(batch.reply_to().text, "are you there");
        assert_eq!(queue.stats().collect_merges, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_mode_single_message_is_sent_verbatim() {
        let (processor, mut rx) = recorder(None);
        let queue = manager(QueueConfig::default(), &processor);
        queue.enqueue(entry("s", "just one", 5)).unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.prompt, "just one");
        assert!(!batch.is_merged());
    }

    #[tokio::test(start_paused = true)]
    async fn session_cap_rejects_and_summarizes() {
        let (processor, mut rx) = recorder(None);
        let config = QueueConfig {
            max_per_session: 2,
            ..QueueConfig::default()
        };
        let queue = manager(config, &processor);
        queue.enqueue(entry("s", "a", 5)).unwrap();
        queue.enqueue(entry("s", "b", 5)).unwrap();
        assert_matches!(
            queue.enqueue(entry("s", &"x".repeat(200), 5)),
            Err(QueueError::SessionFull { max: 2, .. })
        );
        assert_eq!(queue.pending(&SessionKey::from("s")), 2);

        let batch = rx.recv().await.unwrap();
        assert!(batch.prompt.contains("[Dropped messages (summarized)]"));
        assert!(batch.prompt.contains(&format!("[Dropped] {}...", "x".repeat(140))));
        assert_eq!(queue.stats().drop_count, 1);
    }

    #[tokio::test]
    async fn global_cap_evicts_only_for_strictly_higher_priority() {
        let gate = Arc::new(Notify::new());
        let (processor, _rx) = recorder(Some(gate));
        let config = QueueConfig {
            global_max_pending: 2,
            mode: QueueMode::Collect,
            collect_debounce: Duration::from_secs(3600),
            ..QueueConfig::default()
        };
        let queue = manager(config, &processor);
        queue.enqueue(entry("low", "l1", 5)).unwrap();
        queue.enqueue(entry("group", "g1", 5)).unwrap();

        assert_matches!(queue.enqueue(entry("other", "g2", 5)), Err(QueueError::GlobalFull { max: 2 }));
        queue.enqueue(entry("dm", "d1", 10)).unwrap();

        assert_eq!(queue.pending(&SessionKey::from("low")), 0);
        assert_eq!(queue.pending(&SessionKey::from("group")), 1);
        assert_eq!(queue.pending(&SessionKey::from("dm")), 1);
        assert_eq!(queue.total_pending(), 2);
        assert_eq!(queue.stats().drop_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_collect_buffer_discards_pending_work() {
        let (processor, mut rx) = recorder(None);
        let queue = manager(QueueConfig::default(), &processor);
        let key = SessionKey::from("s");
        queue.enqueue(entry("s", "a", 5)).unwrap();
        queue.enqueue(entry("s", "b", 5)).unwrap();
        assert_eq!(queue.clear_collect_buffer(&key), 2);
        assert_eq!(queue.clear_collect_buffer(&key), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.cleanup(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_arriving_mid_turn_merge_into_next_turn() {
        let gate = Arc::new(Notify::new());
        let (processor, mut rx) = recorder(Some(Arc::clone(&gate)));
        let queue = manager(QueueConfig::default(), &processor);
        queue.enqueue(entry("s", "first", 5)).unwrap();
        assert_eq!(rx.recv().await.unwrap().prompt, "first");

        queue.enqueue(entry("s", "second", 5)).unwrap();
        queue.enqueue(entry("s", "third", 5)).unwrap();
        gate.notify_one();
        let next = rx.recv().await.unwrap();
        assert_eq!(next.entries.len(), 2);
        gate.notify_one();
    }

    #[test]
    fn dropped_summaries_cap_and_count_overflow() {
        let mut queue = SessionQueue::default();
        for i in 0..7 {
            queue.record_dropped(&entry("s", &format!("m{i}"), 5), 5);
        }
        let (dropped, overflow) = queue.take_dropped();
        assert_eq!(overflow, 2);
        let section = dropped_section(&dropped, overflow);
        assert!(!section.contains("m0"));
        assert!(!section.contains("m1"));
        assert!(section.contains("m6"));
        assert!(section.ends_with("(and 2 more dropped)"));
    }

    #[test]
    fn collect_prompt_marks_images() {
        let mut with_image = entry("s", "look", 5);
        with_image.message = with_image.message.with_images(vec![ImageContent {
            data: "AAAA".into(),
            mime_type: "image/png".into(),
        }]);
        let prompt = collect_prompt(&[entry("s", "hi", 5), with_image], &[], 0);
        assert!(prompt.contains("Queued #2 (with image)\nlook"));
    }

    #[tokio::test]
    async fn rename_moves_idle_queue() {
        let (processor, _rx) = recorder(None);
        let config = QueueConfig {
            collect_debounce: Duration::from_secs(3600),
            ..QueueConfig::default()
        };
        let queue = manager(config, &processor);
        // A pending debounce blocks the move
        queue.enqueue(entry("old", "a", 5)).unwrap();
        assert!(!queue.rename(&SessionKey::from("old"), &SessionKey::from("new")));
        let _ = queue.clear_collect_buffer(&SessionKey::from("old"));
        assert!(queue.rename(&SessionKey::from("old"), &SessionKey::from("new")));
        assert!(!queue.rename(&SessionKey::from("old"), &SessionKey::from("new")));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn caps_are_never_exceeded(
                ops in proptest::collection::vec((0usize..4, 0i32..12), 1..80),
                max_per_session in 1usize..6,
                global_max in 1usize..12,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .start_paused(true)
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let (processor, _rx) = recorder(Some(Arc::new(Notify::new())));
                    let config = QueueConfig {
                        max_per_session,
                        global_max_pending: global_max,
                        collect_debounce: Duration::from_secs(3600),
                        ..QueueConfig::default()
                    };
                    let queue = manager(config, &processor);
                    for (session, priority) in ops {
                        let key = format!("s{session}");
                        let _ = queue.enqueue(entry(&key, "m", priority));
                        prop_assert!(queue.total_pending() <= global_max);
                        for s in 0..4 {
                            let other = SessionKey::from(format!("s{s}"));
                            let pending = queue.pending(&other);
                            prop_assert!(pending <= max_per_session);
                        }
                    }
                    Ok::<(), TestCaseError>(())
                })?;
            }
        }
    }
}
