//! Pool entries.
//!
//! A [`WorkerProcess`] pairs a [`WorkerConnection`] with the bookkeeping the
//! pool needs: lifecycle state, the bound session, last activity, staleness
//! after a reload and the model currently selected. Only the pool changes
//! state; everyone else reads it or sends commands.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use switchyard_core::{ImageContent, SessionKey, WorkerId};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::warn;

use crate::client::WorkerConnection;
use crate::errors::WorkerError;
use crate::profile::CapabilityProfile;
use crate::protocol::{StreamingBehavior, WorkerCommand, WorkerEvent, WorkerResponse};
use crate::stream::turn_events;

/// Steering and follow-up delivery mode set at initialization.
const ONE_AT_A_TIME: &str = "one-at-a-time";

/// Lifecycle state of a pooled worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Ready and unbound.
    Idle,
    /// Serving a session.
    Bound,
    /// Process exited or was stopped.
    Dead,
}

#[derive(Debug)]
struct WorkerMeta {
    state: WorkerState,
    session_key: Option<SessionKey>,
    last_session: Option<SessionKey>,
    last_activity: Instant,
    stale: bool,
    model: Option<String>,
    turns: u64,
}

/// Point-in-time view of a worker for stats and logs.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    /// Worker id.
    pub id: WorkerId,
    /// OS process id.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub state: WorkerState,
    /// Bound session.
    pub session_key: Option<SessionKey>,
    /// Profile signature.
    pub signature: String,
    /// Role the worker serves.
    pub role: String,
    /// Milliseconds since the last acquire or release.
    pub idle_ms: u64,
    /// Turns served.
    pub turns: u64,
    /// Flagged for replacement at release.
    pub stale: bool,
    /// Model selected with `set_model`.
    pub model: Option<String>,
}

/// One pooled worker.
pub struct WorkerProcess {
    id: WorkerId,
    profile: Arc<CapabilityProfile>,
    connection: Arc<dyn WorkerConnection>,
    meta: Mutex<WorkerMeta>,
}

impl WorkerProcess {
    pub(crate) fn new(id: WorkerId, profile: Arc<CapabilityProfile>, connection: Arc<dyn WorkerConnection>) -> Self {
        Self {
            id,
            profile,
            connection,
            meta: Mutex::new(WorkerMeta {
                state: WorkerState::Idle,
                session_key: None,
                last_session: None,
                last_activity: Instant::now(),
                stale: false,
                model: None,
                turns: 0,
            }),
        }
    }

    /// Worker id.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Profile the worker was spawned with.
    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    /// Profile signature.
    pub fn signature(&self) -> &str {
        &self.profile.signature
    }

    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.connection.pid()
    }

    /// Whether the process is running and the pool has not retired it.
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive() && self.state() != WorkerState::Dead
    }

    /// Lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.meta.lock().state
    }

    /// Session currently bound.
    pub fn session_key(&self) -> Option<SessionKey> {
        self.meta.lock().session_key.clone()
    }

    /// Session served most recently (survives release).
    pub fn last_session(&self) -> Option<SessionKey> {
        self.meta.lock().last_session.clone()
    }

    /// Whether a reload flagged this worker for replacement.
    pub fn is_stale(&self) -> bool {
        self.meta.lock().stale
    }

    /// Model last applied with [`set_model`](Self::set_model).
    pub fn model(&self) -> Option<String> {
        self.meta.lock().model.clone()
    }

    /// Time since the last acquire or release.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.meta.lock().last_activity)
    }

    /// Recent stderr output.
    pub fn stderr_tail(&self) -> String {
        self.connection.stderr_tail()
    }

    /// Exit code, once the process has exited with one.
    pub fn exit_code(&self) -> Option<i32> {
        self.connection.exit_code()
    }

    /// Stats view.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let meta = self.meta.lock();
        WorkerSnapshot {
            id: self.id.clone(),
            pid: self.connection.pid(),
            state: meta.state,
            session_key: meta.session_key.clone(),
            signature: self.profile.signature.clone(),
            role: self.profile.role.clone(),
            idle_ms: Instant::now()
                .saturating_duration_since(meta.last_activity)
                .as_millis() as u64,
            turns: meta.turns,
            stale: meta.stale,
            model: meta.model.clone(),
        }
    }

    // ── state transitions (pool only) ──

    pub(crate) fn bind(&self, session_key: &SessionKey) {
        let mut meta = self.meta.lock();
        meta.state = WorkerState::Bound;
        meta.session_key = Some(session_key.clone());
        meta.last_session = Some(session_key.clone());
        meta.last_activity = Instant::now();
        meta.turns += 1;
    }

    pub(crate) fn unbind(&self) -> Option<SessionKey> {
        let mut meta = self.meta.lock();
        if meta.state == WorkerState::Bound {
            meta.state = WorkerState::Idle;
        }
        meta.last_activity = Instant::now();
        meta.session_key.take()
    }

    pub(crate) fn mark_stale(&self) {
        self.meta.lock().stale = true;
    }

    /// Mark dead and return the session that was bound, if any.
    pub(crate) fn mark_dead(&self) -> Option<SessionKey> {
        let mut meta = self.meta.lock();
        meta.state = WorkerState::Dead;
        meta.session_key.take()
    }

    pub(crate) async fn stop(&self) {
        let _ = self.mark_dead();
        self.connection.stop().await;
    }

    // ── commands ──

    /// Send a raw command.
    pub async fn request(&self, command: WorkerCommand) -> Result<WorkerResponse, WorkerError> {
        self.connection.request(command).await
    }

    /// Start a new turn.
    pub async fn prompt(&self, message: &str, images: &[ImageContent]) -> Result<WorkerResponse, WorkerError> {
        self.request(WorkerCommand::prompt(message, images)).await
    }

    /// Inject a message into the running turn without aborting it.
    pub async fn steer(&self, message: &str) -> Result<WorkerResponse, WorkerError> {
        self.request(WorkerCommand::Prompt {
            message: message.to_string(),
            images: Vec::new(),
            streaming_behavior: Some(StreamingBehavior::Steer),
        })
        .await
    }

    /// Abort the running turn.
    pub async fn abort(&self) -> Result<WorkerResponse, WorkerError> {
        self.request(WorkerCommand::Abort).await
    }

    /// Reset the conversation.
    pub async fn new_session(&self) -> Result<WorkerResponse, WorkerError> {
        self.request(WorkerCommand::NewSession).await
    }

    /// Conversation defaults applied whenever a worker starts serving a
    /// fresh conversation: automatic compaction and retries on, and queued
    /// steering and follow-up messages delivered one at a time. Failures are
    /// logged; the worker stays usable with its own defaults.
    pub async fn initialize(&self) {
        let commands = [
            WorkerCommand::SetAutoCompaction { enabled: true },
            WorkerCommand::SetAutoRetry { enabled: true },
            WorkerCommand::SetSteeringMode {
                mode: ONE_AT_A_TIME.to_string(),
            },
            WorkerCommand::SetFollowUpMode {
                mode: ONE_AT_A_TIME.to_string(),
            },
        ];
        for command in commands {
            let name = command.name();
            if let Err(e) = self.request(command).await {
                warn!(worker_id = %self.id, command = name, error = %e, "worker initialization command failed");
                if !self.is_alive() {
                    return;
                }
            }
        }
    }

    /// Switch model. Accepts `provider/model`, or a bare model id with an
    /// empty provider.
    pub async fn set_model(&self, model: &str) -> Result<WorkerResponse, WorkerError> {
        let (provider, model_id) = model.split_once('/').unwrap_or(("", model));
        let response = self
            .request(WorkerCommand::SetModel {
                provider: provider.to_string(),
                model_id: model_id.to_string(),
            })
            .await?;
        self.meta.lock().model = Some(model.to_string());
        Ok(response)
    }

    /// Subscribe to raw events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.connection.subscribe()
    }

    /// Subscribe and stream one turn's events (see [`turn_events`]).
    pub fn turn_events(&self, timeout: Duration) -> impl Stream<Item = Result<WorkerEvent, WorkerError>> + Send + 'static {
        turn_events(self.subscribe(), timeout)
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("signature", &self.profile.short_signature())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeWorker;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn worker() -> (WorkerProcess, Arc<FakeWorker>) {
        let profile = Arc::new(CapabilityProfile::from_parts(
            "default",
            PathBuf::from("/w"),
            "pi",
            vec![],
            BTreeMap::new(),
        ));
        let fake = Arc::new(FakeWorker::new());
        let process = WorkerProcess::new(WorkerId::new(), profile, fake.clone());
        (process, fake)
    }

    #[tokio::test]
    async fn bind_unbind_tracks_sessions() {
        let (worker, _) = worker();
        let key = SessionKey::from("agent:main:main");
        assert_eq!(worker.state(), WorkerState::Idle);
        worker.bind(&key);
        assert_eq!(worker.state(), WorkerState::Bound);
        assert_eq!(worker.session_key(), Some(key.clone()));
        assert_eq!(worker.unbind(), Some(key.clone()));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.session_key(), None);
        assert_eq!(worker.last_session(), Some(key));
        assert_eq!(worker.snapshot().turns, 1);
    }

    #[tokio::test]
    async fn steer_sends_prompt_with_streaming_behavior() {
        let (worker, fake) = worker();
        let _ = worker.steer("more").await.unwrap();
        assert_eq!(
            fake.commands(),
            vec![WorkerCommand::Prompt {
                message: "more".into(),
                images: vec![],
                streaming_behavior: Some(StreamingBehavior::Steer),
            }]
        );
    }

    #[tokio::test]
    async fn set_model_splits_provider_and_records() {
        let (worker, fake) = worker();
        let _ = worker.set_model("openai/gpt-5").await.unwrap();
        assert_eq!(
            fake.commands(),
            vec![WorkerCommand::SetModel {
                provider: "openai".into(),
                model_id: "gpt-5".into(),
            }]
        );
        assert_eq!(worker.model().as_deref(), Some("openai/gpt-5"));
    }

    #[tokio::test]
    async fn initialize_sends_conversation_defaults() {
        let (worker, fake) = worker();
        worker.initialize().await;
        assert_eq!(
            fake.commands(),
            vec![
                WorkerCommand::SetAutoCompaction { enabled: true },
                WorkerCommand::SetAutoRetry { enabled: true },
                WorkerCommand::SetSteeringMode {
                    mode: "one-at-a-time".into()
                },
                WorkerCommand::SetFollowUpMode {
                    mode: "one-at-a-time".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn initialize_tolerates_rejected_commands() {
        let (worker, fake) = worker();
        fake.fail_command("set_auto_retry");
        worker.initialize().await;
        assert_eq!(fake.count("set_follow_up_mode"), 1);
        assert!(worker.is_alive());
    }

    #[tokio::test]
    async fn dead_worker_is_not_alive() {
        let (worker, _) = worker();
        worker.bind(&SessionKey::from("s"));
        assert_eq!(worker.mark_dead(), Some(SessionKey::from("s")));
        assert!(!worker.is_alive());
        assert_eq!(worker.state(), WorkerState::Dead);
    }
}
