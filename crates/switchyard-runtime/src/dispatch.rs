//! Dispatch pipeline.
//!
//! [`Gateway::dispatch`] is the single entry point for inbound work:
//!
//! ```text
//! route ─▶ dedup ─▶ message_received ─▶ session touch ─▶ busy?
//!                                                        ├─ no  ─▶ enqueue
//!                                                        └─ yes ─▶ steer | follow-up | interrupt
//! ```
//!
//! Queued batches come back through [`TurnProcessor`], which acquires a
//! worker (waiting if the pool is exhausted), runs one turn, sends exactly
//! one reply and releases the worker.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde::Serialize;
use switchyard_core::metrics::{DISPATCH_TOTAL, TURN_DURATION_SECONDS, TURN_ERRORS_TOTAL};
use switchyard_core::{ChatType, InboundMessage, MessageSource, SessionKey};
use switchyard_settings::{GatewaySettings, MessageMode};
use switchyard_worker::{
    CapabilityProfile, PoolConfig, PoolStats, ProfileRequest, RpcPool, SessionEndListener,
    SessionEndNotice, SessionEndReason, TurnOutput, WaitingStats, WorkerError, WorkerProcess,
    WorkerSpawner,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dedup::DeduplicationCache;
use crate::errors::GatewayError;
use crate::hooks::{HookContext, HookEvent, HookRegistry};
use crate::model_health::{ModelHealth, ModelHealthTracker};
use crate::queue::{MessageQueueManager, QueueConfig, QueueEntry, QueueStats, TurnBatch, TurnProcessor};
use crate::router::{DEFAULT_ROLE, SessionRouter};
use crate::sessions::{SessionRegistry, SessionState};

/// Sent when a turn finishes without any assistant text.
pub const EMPTY_REPLY: &str = "I didn't produce any text this time. Please send it again or rephrase.";
/// Sent for a turn that was aborted before producing text.
pub const INTERRUPTED_REPLY: &str = "(interrupted)";

const QUEUE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// What [`Gateway::dispatch`] did with a message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    /// Session the message was routed to.
    pub session_key: Option<SessionKey>,
    /// Injected into the running turn (steer).
    pub injected: bool,
    /// Queued for a new turn.
    pub enqueued: bool,
    /// Dropped as a duplicate.
    pub duplicate: bool,
    /// Refused (queue caps, shutdown). The sender already got an error reply.
    pub rejected: bool,
    /// Mode applied because the session was busy.
    pub mode: Option<MessageMode>,
}

/// Point-in-time view of the whole gateway.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    /// Worker pool.
    pub pool: PoolStats,
    /// Pool waiting list.
    pub waiting: WaitingStats,
    /// Message queue.
    pub queue: QueueStats,
    /// Live sessions.
    pub sessions: usize,
    /// Models with recorded failures.
    pub models: Vec<ModelHealth>,
}

struct GatewayInner {
    settings: RwLock<Arc<GatewaySettings>>,
    pool: RpcPool,
    queue: MessageQueueManager,
    dedup: DeduplicationCache,
    health: ModelHealthTracker,
    sessions: SessionRegistry,
    hooks: HookRegistry,
    shutdown: CancellationToken,
}

/// The gateway core. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Build a gateway over `spawner`. Call [`start`](Self::start) to run
    /// background maintenance.
    pub fn new(settings: GatewaySettings, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let settings = Arc::new(settings);
        let inner = Arc::new_cyclic(|weak: &Weak<GatewayInner>| {
            let processor: Weak<dyn TurnProcessor> = weak.clone();
            GatewayInner {
                pool: RpcPool::new(PoolConfig::from_settings(&settings), spawner),
                queue: MessageQueueManager::new(QueueConfig::from_settings(&settings.queue), processor),
                dedup: DeduplicationCache::from_settings(&settings.queue.dedup),
                health: ModelHealthTracker::new(&settings.agent.model_failover),
                sessions: SessionRegistry::new(),
                hooks: HookRegistry::default(),
                shutdown: CancellationToken::new(),
                settings: RwLock::new(Arc::clone(&settings)),
            }
        });
        let listener: Arc<dyn SessionEndListener> = Arc::new(SessionEndRelay {
            gateway: Arc::downgrade(&inner),
        });
        inner.pool.set_session_end_listener(listener);
        inner.pool.set_prewarm_profile(Arc::new(default_profile(&settings)));
        Self { inner }
    }

    /// Start pool maintenance and periodic queue cleanup.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let maintenance = self.inner.pool.spawn_maintenance();
        let queue = self.inner.queue.clone();
        let shutdown = self.inner.shutdown.clone();
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(QUEUE_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = queue.cleanup();
                        if removed > 0 {
                            debug!(removed, "removed idle session queues");
                        }
                    }
                }
            }
        });
        vec![maintenance, cleanup]
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<GatewaySettings> {
        self.inner.settings()
    }

    /// Submit an inbound message.
    #[instrument(skip_all, fields(channel = %message.source.channel, sender = %message.source.sender_id))]
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        self.inner.dispatch(message).await
    }

    /// Set or clear a session's runtime message mode. Returns `false` for an
    /// unknown session.
    pub fn set_mode_override(&self, session_key: &SessionKey, mode: Option<MessageMode>) -> bool {
        self.inner.sessions.set_mode_override(session_key, mode)
    }

    /// Start a fresh conversation: drop queued input, abort a running turn
    /// and reset the worker that holds the conversation. Returns how many
    /// queued messages were discarded.
    #[instrument(skip(self))]
    pub async fn reset_session(&self, session_key: &SessionKey) -> Result<usize, GatewayError> {
        let inner = &self.inner;
        let cleared = inner.queue.clear_collect_buffer(session_key);
        if let Some(worker) = inner.pool.get_for_session(session_key) {
            if inner.sessions.is_streaming(session_key) {
                if let Err(e) = worker.abort().await {
                    warn!(error = %e, "abort before reset failed");
                }
            }
            let _ = worker.new_session().await?;
        } else if let Some(worker) = inner.pool.claim_for_session(session_key) {
            let reset = worker.new_session().await;
            inner.pool.release(session_key).await;
            let _ = reset?;
        }
        let _ = inner.sessions.remove(session_key);
        let _ = inner
            .hooks
            .emit(HookContext::new(HookEvent::SessionEnd, session_key).with_reason("reset"))
            .await;
        info!(cleared, "session reset");
        Ok(cleared)
    }

    /// Move a session to a new key (e.g. a group upgraded to a supergroup).
    /// Registry state and queued input follow; no lifecycle hooks fire.
    pub fn rename_session(&self, old: &SessionKey, new: &SessionKey) -> bool {
        let moved = self.inner.sessions.rename(old, new);
        let queue_moved = self.inner.queue.rename(old, new);
        debug!(old = %old, new = %new, moved, queue_moved, "session renamed");
        moved
    }

    /// Swap in a new settings snapshot. Idle workers are recycled; bound
    /// ones are replaced when their turn ends.
    pub async fn reload(&self, settings: GatewaySettings) {
        let settings = Arc::new(settings);
        *self.inner.settings.write() = Arc::clone(&settings);
        self.inner.queue.reconfigure(QueueConfig::from_settings(&settings.queue));
        self.inner.pool.set_prewarm_profile(Arc::new(default_profile(&settings)));
        self.inner.pool.reload(PoolConfig::from_settings(&settings)).await;
        info!("settings reloaded");
    }

    /// Lifecycle hook registry.
    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    /// Worker pool.
    pub fn pool(&self) -> &RpcPool {
        &self.inner.pool
    }

    /// Message queue.
    pub fn queue(&self) -> &MessageQueueManager {
        &self.inner.queue
    }

    /// Session registry.
    pub fn session(&self, session_key: &SessionKey) -> Option<SessionState> {
        self.inner.sessions.get(session_key)
    }

    /// Counters for monitoring.
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            pool: self.inner.pool.stats(),
            waiting: self.inner.pool.waiting_stats(),
            queue: self.inner.queue.stats(),
            sessions: self.inner.sessions.len(),
            models: self.inner.health.snapshot(),
        }
    }

    /// Stop accepting work, drop queued input and stop every worker.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let dropped = self.inner.queue.shutdown();
        info!(dropped, "gateway shutting down");
        self.inner.pool.shutdown().await;
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("pool", &self.inner.pool).finish_non_exhaustive()
    }
}

impl GatewayInner {
    fn settings(&self) -> Arc<GatewaySettings> {
        Arc::clone(&self.settings.read())
    }

    async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        let settings = self.settings();
        let router = SessionRouter::new(&settings);
        let route = router.route(&message.source, &message.text, message.session_key.as_ref());
        let key = route.session_key.clone();
        let mut outcome = DispatchOutcome {
            session_key: Some(key.clone()),
            ..DispatchOutcome::default()
        };

        if self.shutdown.is_cancelled() {
            reply(&message, &GatewayError::ShuttingDown.user_message()).await;
            counter!(DISPATCH_TOTAL, "outcome" => "rejected").increment(1);
            outcome.rejected = true;
            return outcome;
        }
        if self.dedup.check_and_record(&message.source, &message.text) {
            debug!(session_key = %key, "duplicate message dropped");
            counter!(DISPATCH_TOTAL, "outcome" => "duplicate").increment(1);
            outcome.duplicate = true;
            return outcome;
        }
        if route.text.trim().is_empty() && message.images.is_empty() {
            debug!(session_key = %key, "empty message ignored");
            counter!(DISPATCH_TOTAL, "outcome" => "empty").increment(1);
            return outcome;
        }

        let _ = self
            .hooks
            .emit(
                HookContext::new(HookEvent::MessageReceived, &key)
                    .with_agent(&route.agent_id)
                    .with_text(&route.text),
            )
            .await;

        let role = router.resolve_role(&message.source, &route.agent_id);
        if self.sessions.touch(&key, &route.agent_id, &role, &message.source.channel) {
            info!(session_key = %key, agent_id = %route.agent_id, role = %role, "session started");
            let _ = self
                .hooks
                .emit(HookContext::new(HookEvent::SessionStart, &key).with_agent(&route.agent_id))
                .await;
        }

        if self.sessions.is_streaming(&key) {
            if let Some(worker) = self.pool.get_for_session(&key) {
                let mode = self
                    .sessions
                    .mode_override(&key)
                    .unwrap_or_else(|| router.configured_mode(&message.source));
                outcome.mode = Some(mode);
                match mode {
                    MessageMode::Steer => match worker.steer(&route.text).await {
                        Ok(_) => {
                            info!(session_key = %key, worker_id = %worker.id(), "message steered into running turn");
                            counter!(DISPATCH_TOTAL, "outcome" => "injected").increment(1);
                            outcome.injected = true;
                            return outcome;
                        }
                        Err(e) => warn!(session_key = %key, error = %e, "steer failed, queueing instead"),
                    },
                    MessageMode::FollowUp => {
                        debug!(session_key = %key, "session busy, message follows up");
                    }
                    MessageMode::Interrupt => self.interrupt(&key, &worker).await,
                }
            }
        }

        let priority = message_priority(&settings, &router, &message.source, &key);
        let entry = QueueEntry::new(key.clone(), route.agent_id, route.text, message.clone(), priority);
        match self.queue.enqueue(entry) {
            Ok(()) => {
                counter!(DISPATCH_TOTAL, "outcome" => "enqueued").increment(1);
                outcome.enqueued = true;
            }
            Err(e) => {
                let err = GatewayError::from(e);
                reply(&message, &err.user_message()).await;
                counter!(DISPATCH_TOTAL, "outcome" => "rejected").increment(1);
                outcome.rejected = true;
            }
        }
        outcome
    }

    async fn interrupt(&self, session_key: &SessionKey, worker: &WorkerProcess) {
        let cleared = self.queue.clear_collect_buffer(session_key);
        if let Err(e) = worker.abort().await {
            warn!(session_key = %session_key, error = %e, "abort failed");
        }
        self.sessions.set_streaming(session_key, false, None);
        info!(session_key = %session_key, cleared, "interrupted running turn");
    }

    async fn run_turn(&self, batch: TurnBatch) {
        let key = batch.session_key.clone();
        let entry = batch.reply_to();
        let message = &entry.message;
        let agent_id = entry.agent_id.as_str();

        let settings = self.settings();
        let router = SessionRouter::new(&settings);
        let role = router.resolve_role(&message.source, agent_id);
        let cwd = router.workspace_dir(&role, agent_id);
        let agent_model = settings.agents.get(agent_id).and_then(|a| a.model.as_deref());
        let profile = Arc::new(CapabilityProfile::build(
            &settings,
            &ProfileRequest {
                role: &role,
                cwd: &cwd,
                session_key: Some(&key),
                model: agent_model,
            },
        ));
        let chain = model_chain(&settings, agent_model);
        let selected = self.health.select_model(&chain).map(str::to_owned);

        typing(message, true).await;
        let worker = match self.pool.acquire_or_wait(&key, &profile, entry.priority).await {
            Ok(worker) => worker,
            Err(e) => {
                let err = GatewayError::from(e);
                counter!(TURN_ERRORS_TOTAL, "category" => err.category()).increment(1);
                warn!(session_key = %key, error = %err, "no worker for turn");
                self.deliver(&key, agent_id, message, &err.user_message()).await;
                typing(message, false).await;
                let _ = self
                    .hooks
                    .emit(HookContext::new(HookEvent::AgentEnd, &key).with_agent(agent_id).with_reason(err.category()))
                    .await;
                return;
            }
        };

        let configured = agent_model.map(str::to_owned).or_else(|| settings.agent.model.clone());
        if let Some(model) = &selected {
            if worker.model().or_else(|| configured.clone()).as_deref() != Some(model.as_str()) {
                match worker.set_model(model).await {
                    Ok(_) => info!(session_key = %key, model = %model, "switched model"),
                    Err(e) => warn!(session_key = %key, model = %model, error = %e, "model switch failed"),
                }
            }
        }
        let model = worker.model().or(configured);

        self.sessions.set_streaming(&key, true, Some(worker.id().clone()));
        let _ = self
            .hooks
            .emit(
                HookContext::new(HookEvent::BeforeAgentStart, &key)
                    .with_agent(agent_id)
                    .with_text(&batch.prompt),
            )
            .await;

        let timeout = Duration::from_millis(settings.agent.timeout_ms);
        let mut discard = false;
        let started = Instant::now();
        let result = stream_turn(&worker, &batch, timeout).await;
        histogram!(TURN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        self.sessions.set_streaming(&key, false, None);

        let (text, reason) = match result {
            Ok(output) => {
                debug!(
                    session_key = %key,
                    events = output.event_count,
                    tools = output.tool_labels.len(),
                    stop_reason = ?output.stop_reason,
                    "turn finished"
                );
                (self.settle(&key, model.as_deref(), &output), output.stop_reason)
            }
            Err(e) => {
                if matches!(e, WorkerError::TurnTimeout { .. }) {
                    let grace = Duration::from_millis(settings.agent.abort_grace_ms);
                    if !abort_turn(&worker, grace).await {
                        warn!(
                            session_key = %key,
                            worker_id = %worker.id(),
                            grace_ms = settings.agent.abort_grace_ms,
                            "worker did not end the timed out turn, stopping it"
                        );
                        discard = true;
                    }
                }
                if let Some(model) = model.as_deref().filter(|_| !e.is_crash()) {
                    let _ = self.health.record_failure(model, &e.to_string());
                }
                let err = GatewayError::from(e);
                counter!(TURN_ERRORS_TOTAL, "category" => err.category()).increment(1);
                warn!(session_key = %key, worker_id = %worker.id(), error = %err, "turn failed");
                (err.user_message(), Some(err.category().to_string()))
            }
        };

        self.deliver(&key, agent_id, message, &text).await;
        typing(message, false).await;
        if discard {
            self.pool.discard(&key).await;
        } else {
            self.pool.release(&key).await;
        }

        let mut end = HookContext::new(HookEvent::AgentEnd, &key).with_agent(agent_id);
        if let Some(reason) = reason {
            end = end.with_reason(reason);
        }
        let _ = self.hooks.emit(end).await;
    }

    /// Reply text for a finished turn, feeding model health.
    fn settle(&self, session_key: &SessionKey, model: Option<&str>, output: &TurnOutput) -> String {
        if let Some(error) = &output.error_message {
            if let Some(model) = model {
                let category = self.health.record_failure(model, error);
                counter!(TURN_ERRORS_TOTAL, "category" => category.as_str()).increment(1);
            }
            warn!(session_key = %session_key, error = %error, "turn ended with provider error");
            if !output.has_text() {
                return format!("Error: {error}");
            }
        } else if let Some(model) = model {
            self.health.record_success(model);
        }

        if output.has_text() {
            output.text.clone()
        } else if output.stop_reason.as_deref() == Some("aborted") {
            INTERRUPTED_REPLY.to_string()
        } else {
            warn!(session_key = %session_key, "empty assistant response, sending fallback");
            EMPTY_REPLY.to_string()
        }
    }

    async fn deliver(&self, session_key: &SessionKey, agent_id: &str, message: &InboundMessage, text: &str) {
        let _ = self
            .hooks
            .emit(
                HookContext::new(HookEvent::MessageSending, session_key)
                    .with_agent(agent_id)
                    .with_text(text),
            )
            .await;
        match message.respond(text).await {
            Ok(()) => {
                let _ = self
                    .hooks
                    .emit(HookContext::new(HookEvent::MessageSent, session_key).with_agent(agent_id))
                    .await;
            }
            Err(e) => warn!(session_key = %session_key, error = %e, "reply delivery failed"),
        }
    }
}

/// Abort the running turn and wait up to `grace` for the worker to close it.
/// False when the turn never ended, leaving the worker unusable.
async fn abort_turn(worker: &WorkerProcess, grace: Duration) -> bool {
    let mut events = std::pin::pin!(worker.turn_events(grace));
    if let Err(e) = worker.abort().await {
        warn!(worker_id = %worker.id(), error = %e, "abort after timeout failed");
        return false;
    }
    loop {
        match events.next().await {
            Some(Ok(_)) => {}
            Some(Err(_)) => return false,
            None => return true,
        }
    }
}

#[async_trait]
impl TurnProcessor for GatewayInner {
    async fn process(&self, batch: TurnBatch) {
        self.run_turn(batch).await;
    }
}

/// Relays pool session-end notices into the registry and hooks.
struct SessionEndRelay {
    gateway: Weak<GatewayInner>,
}

impl SessionEndListener for SessionEndRelay {
    fn session_ended(&self, notice: SessionEndNotice) {
        let Some(inner) = self.gateway.upgrade() else {
            return;
        };
        let reason = match notice.reason {
            SessionEndReason::WorkerExited { code } => match code {
                Some(code) => format!("worker exited with code {code}"),
                None => "worker exited".to_string(),
            },
            SessionEndReason::Shutdown => "shutdown".to_string(),
        };
        warn!(
            session_key = %notice.session_key,
            worker_id = %notice.worker_id,
            reason = %reason,
            stderr = %notice.stderr_tail,
            "session ended"
        );
        let _ = inner.sessions.remove(&notice.session_key);
        let _ = tokio::spawn(async move {
            let _ = inner
                .hooks
                .emit(HookContext::new(HookEvent::SessionEnd, &notice.session_key).with_reason(reason))
                .await;
        });
    }
}

/// Run one turn: subscribe, prompt, fold events until `agent_end`.
async fn stream_turn(worker: &WorkerProcess, batch: &TurnBatch, timeout: Duration) -> Result<TurnOutput, WorkerError> {
    let mut events = std::pin::pin!(worker.turn_events(timeout));
    let _ = worker.prompt(&batch.prompt, &batch.images).await?;
    let mut output = TurnOutput::default();
    while let Some(event) = events.next().await {
        output.apply(&event?);
    }
    Ok(output)
}

async fn reply(message: &InboundMessage, text: &str) {
    if let Err(e) = message.respond(text).await {
        warn!(error = %e, "reply delivery failed");
    }
}

async fn typing(message: &InboundMessage, on: bool) {
    if let Err(e) = message.set_typing(on).await {
        debug!(error = %e, "typing indicator failed");
    }
}

/// Cross-session priority of a message: webhook, direct or group weight,
/// plus the allow-list bonus.
pub fn message_priority(
    settings: &GatewaySettings,
    router: &SessionRouter<'_>,
    source: &MessageSource,
    session_key: &SessionKey,
) -> i32 {
    let weights = &settings.queue.priority;
    let base = if session_key.is_hook() || source.channel == "webhook" {
        weights.webhook
    } else if source.chat_type == ChatType::Dm {
        weights.dm
    } else {
        weights.group
    };
    if router.is_allow_listed(source) {
        base + weights.allowlist_bonus
    } else {
        base
    }
}

/// `[agent model or primary, ...fallbacks]`.
fn model_chain(settings: &GatewaySettings, agent_model: Option<&str>) -> Vec<String> {
    match agent_model {
        Some(model) => std::iter::once(model.to_string())
            .chain(settings.agent.model_failover.fallbacks.iter().cloned())
            .collect(),
        None => settings.agent.model_chain(),
    }
}

/// Profile of the default agent, used to pre-warm the pool.
fn default_profile(settings: &GatewaySettings) -> CapabilityProfile {
    let router = SessionRouter::new(settings);
    let agent_id = router.default_agent();
    let agent = settings.agents.get(agent_id);
    let role = agent
        .and_then(|a| a.role.clone())
        .unwrap_or_else(|| DEFAULT_ROLE.to_string());
    let cwd = router.workspace_dir(&role, agent_id);
    CapabilityProfile::build(
        settings,
        &ProfileRequest {
            role: &role,
            cwd: &cwd,
            session_key: None,
            model: agent.and_then(|a| a.model.as_deref()),
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HookError;
    use crate::hooks::GatewayHook;
    use parking_lot::Mutex;
    use switchyard_core::message::testing::RecordingResponder;
    use switchyard_settings::{ChannelSettings, QueueMode};
    use switchyard_worker::WorkerCommand;
    use switchyard_worker::testing::{FakeWorker, ScriptedSpawner, TurnScript};

    fn settings(mode: MessageMode) -> GatewaySettings {
        let mut settings = GatewaySettings::default();
        settings.agent.message_mode = mode;
        settings.agent.pool.min = 0;
        settings.agent.pool.max = 2;
        settings.queue.mode = QueueMode::Individual;
        settings
    }

    fn gateway(settings: GatewaySettings, script: TurnScript) -> (Gateway, Arc<ScriptedSpawner>) {
        let spawner = Arc::new(ScriptedSpawner::with_default(script));
        (Gateway::new(settings, spawner.clone()), spawner)
    }

    fn group(chat: &str, text: &str) -> (InboundMessage, Arc<RecordingResponder>) {
        let responder = Arc::new(RecordingResponder::default());
        let message = InboundMessage::new(MessageSource::group("test", chat, "u1"), text, responder.clone());
        (message, responder)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn held_turn(gateway: &Gateway, spawner: &ScriptedSpawner, text: &str) -> (SessionKey, Arc<FakeWorker>, Arc<RecordingResponder>) {
        let (message, responder) = group("g1", text);
        let outcome = gateway.dispatch(message).await;
        assert!(outcome.enqueued);
        let key = outcome.session_key.unwrap();
        wait_until(|| spawner.last().is_some_and(|w| w.turn_open())).await;
        let fake = spawner.last().unwrap();
        wait_until(|| gateway.inner.sessions.is_streaming(&key)).await;
        (key, fake, responder)
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<HookEvent>>);

    #[async_trait]
    impl GatewayHook for EventLog {
        fn name(&self) -> &str {
            "event-log"
        }
        async fn handle(&self, context: &HookContext) -> Result<(), HookError> {
            self.0.lock().push(context.event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn idle_session_runs_a_turn_and_replies_once() {
        let (gateway, spawner) = gateway(settings(MessageMode::Steer), TurnScript::Echo);
        let log = Arc::new(EventLog::default());
        gateway.hooks().register(log.clone()).unwrap();

        let (message, responder) = group("g1", "hello");
        let outcome = gateway.dispatch(message).await;
        assert!(outcome.enqueued && !outcome.injected);

        wait_until(|| !responder.replies().is_empty()).await;
        assert_eq!(responder.replies(), vec!["echo: hello"]);
        assert_eq!(responder.typing(), vec![true, false]);
        assert_eq!(spawner.spawn_count(), 1);
        wait_until(|| log.0.lock().contains(&HookEvent::AgentEnd)).await;
        assert_eq!(
            *log.0.lock(),
            vec![
                HookEvent::MessageReceived,
                HookEvent::SessionStart,
                HookEvent::BeforeAgentStart,
                HookEvent::MessageSending,
                HookEvent::MessageSent,
                HookEvent::AgentEnd,
            ]
        );
        wait_until(|| gateway.pool().stats().idle == 1).await;
    }

    #[tokio::test]
    async fn busy_session_steer_injects_without_abort() {
        let (gateway, spawner) = gateway(settings(MessageMode::Steer), TurnScript::Hold);
        let (key, fake, responder) = held_turn(&gateway, &spawner, "first").await;

        let (second, second_responder) = group("g1", "also this");
        let outcome = gateway.dispatch(second).await;
        assert!(outcome.injected);
        assert!(!outcome.enqueued);
        assert_eq!(outcome.mode, Some(MessageMode::Steer));
        assert_eq!(fake.count("abort"), 0);
        assert_eq!(fake.prompts(), vec!["first"]);
        assert!(fake.commands().iter().any(|c| matches!(
            c,
            WorkerCommand::Prompt { message, streaming_behavior: Some(_), .. } if message == "also this"
        )));
        assert_eq!(gateway.queue().pending(&key), 0);

        fake.finish_turn("done");
        wait_until(|| !responder.replies().is_empty()).await;
        assert_eq!(responder.replies(), vec!["done"]);
        assert!(second_responder.replies().is_empty());
    }

    #[tokio::test]
    async fn busy_session_follow_up_queues_next_turn() {
        let (gateway, spawner) = gateway(settings(MessageMode::FollowUp), TurnScript::Hold);
        let (key, fake, first_responder) = held_turn(&gateway, &spawner, "first").await;

        let (second, second_responder) = group("g1", "second");
        let outcome = gateway.dispatch(second).await;
        assert!(outcome.enqueued && !outcome.injected);
        assert_eq!(fake.count("abort"), 0);
        assert_eq!(fake.count("prompt"), 1);
        assert_eq!(gateway.queue().pending(&key), 1);

        fake.finish_turn("one");
        wait_until(|| fake.turn_open()).await;
        assert_eq!(fake.prompts(), vec!["first", "second"]);
        fake.finish_turn("two");
        wait_until(|| !second_responder.replies().is_empty()).await;
        assert_eq!(first_responder.replies(), vec!["one"]);
        assert_eq!(second_responder.replies(), vec!["two"]);
    }

    #[tokio::test]
    async fn busy_session_interrupt_aborts_clears_and_queues() {
        let (gateway, spawner) = gateway(settings(MessageMode::Interrupt), TurnScript::Hold);
        let (key, fake, first_responder) = held_turn(&gateway, &spawner, "first").await;

        // Park one message in the buffer via a follow-up override
        assert!(gateway.set_mode_override(&key, Some(MessageMode::FollowUp)));
        let (parked, parked_responder) = group("g1", "parked");
        assert!(gateway.dispatch(parked).await.enqueued);
        assert_eq!(gateway.queue().pending(&key), 1);
        assert!(gateway.set_mode_override(&key, None));

        let (urgent, urgent_responder) = group("g1", "urgent");
        let outcome = gateway.dispatch(urgent).await;
        assert_eq!(outcome.mode, Some(MessageMode::Interrupt));
        assert!(outcome.enqueued);
        assert_eq!(fake.count("abort"), 1);

        wait_until(|| !first_responder.replies().is_empty()).await;
        assert_eq!(first_responder.replies(), vec![INTERRUPTED_REPLY]);

        wait_until(|| fake.prompts().len() == 2).await;
        assert_eq!(fake.prompts(), vec!["first", "urgent"]);
        fake.finish_turn("handled");
        wait_until(|| !urgent_responder.replies().is_empty()).await;
        assert_eq!(urgent_responder.replies(), vec!["handled"]);
        assert!(parked_responder.replies().is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_runs_one_turn() {
        let (gateway, spawner) = gateway(settings(MessageMode::FollowUp), TurnScript::Echo);
        let (first, first_responder) = group("g1", "same text");
        let (again, again_responder) = group("g1", "same text");
        assert!(gateway.dispatch(first).await.enqueued);
        let outcome = gateway.dispatch(again).await;
        assert!(outcome.duplicate && !outcome.enqueued);

        wait_until(|| !first_responder.replies().is_empty()).await;
        assert_eq!(spawner.last().unwrap().prompts().len(), 1);
        assert!(again_responder.replies().is_empty());
    }

    #[tokio::test]
    async fn turns_of_one_session_run_in_order() {
        let (gateway, spawner) = gateway(settings(MessageMode::FollowUp), TurnScript::Echo);
        let mut responders = Vec::new();
        for i in 0..5 {
            let (message, responder) = group("g1", &format!("m{i}"));
            assert!(gateway.dispatch(message).await.enqueued);
            responders.push(responder);
        }
        wait_until(|| responders.iter().all(|r| !r.replies().is_empty())).await;
        let fake = spawner.last().unwrap();
        assert_eq!(fake.prompts(), vec!["m0", "m1", "m2", "m3", "m4"]);
        for (i, responder) in responders.iter().enumerate() {
            assert_eq!(responder.replies(), vec![format!("echo: m{i}")]);
        }
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_replies_busy_after_wait() {
        let mut settings = settings(MessageMode::FollowUp);
        settings.agent.pool.max = 1;
        settings.queue.pool_wait_ttl_ms = 50;
        let (gateway, spawner) = gateway(settings, TurnScript::Hold);
        let (_key, fake, _) = held_turn(&gateway, &spawner, "holding").await;

        let (other, responder) = group("g2", "hello?");
        assert!(gateway.dispatch(other).await.enqueued);
        wait_until(|| !responder.replies().is_empty()).await;
        assert_eq!(responder.replies().len(), 1);
        assert!(responder.replies()[0].contains("busy"));
        fake.finish_turn("done");
    }

    #[tokio::test]
    async fn crash_mid_turn_replies_and_ends_session() {
        let (gateway, _spawner) = gateway(settings(MessageMode::Steer), TurnScript::Crash);
        let log = Arc::new(EventLog::default());
        gateway.hooks().register(log.clone()).unwrap();

        let (message, responder) = group("g1", "boom");
        let key = gateway.dispatch(message).await.session_key.unwrap();
        wait_until(|| !responder.replies().is_empty()).await;
        assert_eq!(responder.replies().len(), 1);
        assert!(responder.replies()[0].contains("stopped unexpectedly"));
        wait_until(|| log.0.lock().contains(&HookEvent::SessionEnd)).await;
        assert!(gateway.session(&key).is_none());
        assert_eq!(gateway.pool().stats().total, 0);
    }

    #[tokio::test]
    async fn turn_timeout_aborts_and_replies() {
        let mut settings = settings(MessageMode::Steer);
        settings.agent.timeout_ms = 50;
        let (gateway, spawner) = gateway(settings, TurnScript::Hold);
        let (message, responder) = group("g1", "anyone?");
        let _ = gateway.dispatch(message).await;
        wait_until(|| !responder.replies().is_empty()).await;
        assert!(responder.replies()[0].contains("too long"));
        assert_eq!(spawner.last().unwrap().count("abort"), 1);
        wait_until(|| gateway.pool().stats().idle == 1).await;
        assert_eq!(gateway.pool().stats().total, 1);
    }

    #[tokio::test]
    async fn timed_out_turn_that_ignores_abort_stops_worker() {
        let mut settings = settings(MessageMode::Steer);
        settings.agent.timeout_ms = 50;
        settings.agent.abort_grace_ms = 50;
        let (gateway, spawner) = gateway(settings, TurnScript::Silent);
        let (message, responder) = group("g1", "anyone?");
        let _ = gateway.dispatch(message).await;
        wait_until(|| !responder.replies().is_empty()).await;
        assert!(responder.replies()[0].contains("too long"));
        assert_eq!(spawner.last().unwrap().count("abort"), 1);
        wait_until(|| gateway.pool().stats().total == 0).await;

        // The next turn must not share a stream with the abandoned one
        spawner.set_default_script(TurnScript::Echo);
        let (message, responder) = group("g1", "again");
        let _ = gateway.dispatch(message).await;
        wait_until(|| !responder.replies().is_empty()).await;
        assert_eq!(responder.replies(), vec!["echo: again"]);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn empty_turn_gets_fallback_text() {
        let (gateway, _spawner) = gateway(settings(MessageMode::Steer), TurnScript::Reply(String::new()));
        let (message, responder) = group("g1", "say nothing");
        let _ = gateway.dispatch(message).await;
        wait_until(|| !responder.replies().is_empty()).await;
        assert_eq!(responder.replies(), vec![EMPTY_REPLY]);
    }

    #[tokio::test]
    async fn provider_failure_fails_over_on_next_turn() {
        let mut settings = settings(MessageMode::FollowUp);
        settings.agent.model = Some("anthropic/alpha".into());
        settings.agent.model_failover.fallbacks = vec!["openai/beta".into()];
        let (gateway, spawner) = gateway(settings, TurnScript::Fail("429 rate limit exceeded".into()));

        let (first, first_responder) = group("g1", "one");
        let _ = gateway.dispatch(first).await;
        wait_until(|| !first_responder.replies().is_empty()).await;
        assert_eq!(first_responder.replies(), vec!["Error: 429 rate limit exceeded"]);

        let fake = spawner.last().unwrap();
        fake.push_script(TurnScript::Reply("fine now".into()));
        let (second, second_responder) = group("g1", "two");
        let _ = gateway.dispatch(second).await;
        wait_until(|| !second_responder.replies().is_empty()).await;
        assert_eq!(second_responder.replies(), vec!["fine now"]);
        assert!(fake.commands().iter().any(|c| matches!(
            c,
            WorkerCommand::SetModel { provider, model_id } if provider == "openai" && model_id == "beta"
        )));
    }

    #[tokio::test]
    async fn session_queue_cap_rejects_with_reply() {
        let mut settings = settings(MessageMode::FollowUp);
        settings.queue.max_per_session = 1;
        let (gateway, spawner) = gateway(settings, TurnScript::Hold);
        let (_key, fake, _) = held_turn(&gateway, &spawner, "first").await;

        let (queued, _) = group("g1", "queued");
        assert!(gateway.dispatch(queued).await.enqueued);
        let (overflow, responder) = group("g1", "overflow");
        let outcome = gateway.dispatch(overflow).await;
        assert!(outcome.rejected);
        assert_eq!(responder.replies(), vec!["Too many messages queued. Please wait."]);
        fake.finish_turn("done");
    }

    #[tokio::test]
    async fn reset_session_resets_the_idle_worker() {
        let (gateway, spawner) = gateway(settings(MessageMode::Steer), TurnScript::Echo);
        let (message, responder) = group("g1", "remember this");
        let key = gateway.dispatch(message).await.session_key.unwrap();
        wait_until(|| !responder.replies().is_empty()).await;
        wait_until(|| gateway.pool().stats().idle == 1).await;

        assert_eq!(gateway.reset_session(&key).await.unwrap(), 0);
        assert_eq!(spawner.last().unwrap().count("new_session"), 1);
        assert!(gateway.session(&key).is_none());
        assert_eq!(gateway.pool().stats().idle, 1);
    }

    #[tokio::test]
    async fn rename_moves_state_without_hooks() {
        let (gateway, _spawner) = gateway(settings(MessageMode::Steer), TurnScript::Echo);
        let log = Arc::new(EventLog::default());
        gateway.hooks().register(log.clone()).unwrap();
        let (message, _) = group("g1", "hi");
        let old = gateway.dispatch(message).await.session_key.unwrap();
        wait_until(|| log.0.lock().contains(&HookEvent::AgentEnd)).await;
        let seen = log.0.lock().len();

        let new = SessionKey::from("agent:main:test:group:g1-upgraded");
        assert!(gateway.rename_session(&old, &new));
        assert!(gateway.session(&old).is_none());
        assert!(gateway.session(&new).is_some());
        assert_eq!(log.0.lock().len(), seen);
    }

    #[tokio::test]
    async fn reload_recycles_idle_workers() {
        let (gateway, _spawner) = gateway(settings(MessageMode::Steer), TurnScript::Echo);
        let (message, responder) = group("g1", "hi");
        let _ = gateway.dispatch(message).await;
        wait_until(|| !responder.replies().is_empty()).await;
        wait_until(|| gateway.pool().stats().idle == 1).await;

        let mut next = settings(MessageMode::Interrupt);
        next.agent.pool.max = 3;
        gateway.reload(next).await;
        assert_eq!(gateway.pool().stats().total, 0);
        assert_eq!(gateway.pool().stats().max_capacity, 3);
        assert_eq!(gateway.settings().agent.message_mode, MessageMode::Interrupt);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let (gateway, _spawner) = gateway(settings(MessageMode::Steer), TurnScript::Echo);
        gateway.shutdown().await;
        let (message, responder) = group("g1", "late");
        let outcome = gateway.dispatch(message).await;
        assert!(outcome.rejected);
        assert_eq!(responder.replies().len(), 1);
    }

    #[test]
    fn priority_weights_by_source() {
        let mut settings = GatewaySettings::default();
        let _ = settings.channels.insert(
            "vip".into(),
            ChannelSettings {
                allow_from: vec!["boss".into()],
                ..ChannelSettings::default()
            },
        );
        let router = SessionRouter::new(&settings);
        let dm = MessageSource::dm("test", "u1");
        let grp = MessageSource::group("test", "g", "u1");
        let vip = MessageSource::dm("vip", "boss");
        let any = SessionKey::from("agent:main:main");
        assert_eq!(message_priority(&settings, &router, &dm, &any), 10);
        assert_eq!(message_priority(&settings, &router, &grp, &any), 5);
        assert_eq!(message_priority(&settings, &router, &dm, &SessionKey::from("hook:abc")), 3);
        assert_eq!(message_priority(&settings, &router, &vip, &any), 12);
    }
}
