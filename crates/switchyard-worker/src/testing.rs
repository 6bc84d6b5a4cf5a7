//! In-memory workers for tests.
//!
//! [`ScriptedSpawner`] implements [`WorkerSpawner`] with [`FakeWorker`]s that
//! record every command, acknowledge it, and play a [`TurnScript`] for each
//! prompt. Pool, queue and dispatch tests use these instead of subprocesses.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::WorkerId;
use tokio::sync::broadcast;

use crate::client::{SpawnRequest, WorkerConnection, WorkerSpawner};
use crate::errors::WorkerError;
use crate::profile::CapabilityProfile;
use crate::protocol::{AssistantDelta, DeltaKind, WorkerCommand, WorkerEvent, WorkerResponse};

/// How a fake worker answers one prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnScript {
    /// Stream this text and end the turn.
    Reply(String),
    /// Reply with `echo: {prompt}`.
    Echo,
    /// Start the turn and leave it open until [`FakeWorker::finish_turn`] or an abort.
    Hold,
    /// End the turn with a provider error.
    Fail(String),
    /// Acknowledge and emit nothing, not even after an abort.
    Silent,
    /// Exit mid-turn.
    Crash,
}

/// Scripted in-memory worker.
#[derive(Debug)]
pub struct FakeWorker {
    pid: u32,
    commands: Mutex<Vec<WorkerCommand>>,
    scripts: Mutex<VecDeque<TurnScript>>,
    default_script: TurnScript,
    failing: Mutex<HashSet<&'static str>>,
    events: broadcast::Sender<WorkerEvent>,
    alive: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    turn_open: AtomicBool,
}

static NEXT_PID: AtomicUsize = AtomicUsize::new(10_000);

impl Default for FakeWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWorker {
    /// Worker that echoes prompts.
    pub fn new() -> Self {
        Self::with_default(TurnScript::Echo)
    }

    /// Worker that plays `script` whenever no queued script is left.
    pub fn with_default(script: TurnScript) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed) as u32,
            commands: Mutex::new(Vec::new()),
            scripts: Mutex::new(VecDeque::new()),
            default_script: script,
            failing: Mutex::new(HashSet::new()),
            events,
            alive: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            turn_open: AtomicBool::new(false),
        }
    }

    /// Queue a script for the next prompt.
    pub fn push_script(&self, script: TurnScript) {
        self.scripts.lock().push_back(script);
    }

    /// Make every command with this wire name fail.
    pub fn fail_command(&self, name: &'static str) {
        let _ = self.failing.lock().insert(name);
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<WorkerCommand> {
        self.commands.lock().clone()
    }

    /// Number of received commands with this wire name.
    pub fn count(&self, name: &str) -> usize {
        self.commands.lock().iter().filter(|c| c.name() == name).count()
    }

    /// Messages of plain prompts (not mid-turn injections), in order.
    pub fn prompts(&self) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                WorkerCommand::Prompt {
                    message,
                    streaming_behavior: None,
                    ..
                } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether a held turn is open.
    pub fn turn_open(&self) -> bool {
        self.turn_open.load(Ordering::Acquire)
    }

    /// Complete a held turn with `text`.
    pub fn finish_turn(&self, text: &str) {
        if self.turn_open.swap(false, Ordering::AcqRel) {
            self.emit_reply(text);
        }
    }

    /// Simulate the process exiting.
    pub fn crash(&self, code: Option<i32>) {
        if self.alive.swap(false, Ordering::AcqRel) {
            *self.exit_code.lock() = code;
            self.turn_open.store(false, Ordering::Release);
            let _ = self.events.send(WorkerEvent::Exited { code });
        }
    }

    /// Wait until `count` commands named `name` have arrived.
    pub async fn wait_for(&self, name: &str, count: usize) {
        for _ in 0..2_000 {
            if self.count(name) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} {name} commands");
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_reply(&self, text: &str) {
        self.emit(WorkerEvent::MessageUpdate(text_delta(text)));
        self.emit(WorkerEvent::MessageEnd {
            stop_reason: Some("stop".into()),
            error_message: None,
        });
        self.emit(WorkerEvent::AgentEnd);
    }

    fn play(&self, message: &str) {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());
        self.emit(WorkerEvent::AgentStart);
        match script {
            TurnScript::Reply(text) => self.emit_reply(&text),
            TurnScript::Echo => self.emit_reply(&format!("echo: {message}")),
            TurnScript::Hold => self.turn_open.store(true, Ordering::Release),
            TurnScript::Fail(error) => {
                self.emit(WorkerEvent::MessageEnd {
                    stop_reason: Some("error".into()),
                    error_message: Some(error),
                });
                self.emit(WorkerEvent::AgentEnd);
            }
            TurnScript::Silent => {}
            TurnScript::Crash => self.crash(Some(1)),
        }
    }
}

/// Text delta event payload.
pub fn text_delta(text: &str) -> AssistantDelta {
    AssistantDelta {
        kind: DeltaKind::TextDelta,
        delta: Some(text.to_string()),
        content: None,
        partial_text: None,
    }
}

#[async_trait]
impl WorkerConnection for FakeWorker {
    async fn request(&self, command: WorkerCommand) -> Result<WorkerResponse, WorkerError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(WorkerError::Exited { code: None });
        }
        let name = command.name();
        self.commands.lock().push(command.clone());
        if self.failing.lock().contains(name) {
            return Err(WorkerError::CommandFailed {
                command: name.to_string(),
                message: "scripted failure".into(),
            });
        }
        match &command {
            WorkerCommand::Prompt {
                message,
                streaming_behavior: None,
                ..
            } => self.play(message),
            WorkerCommand::Abort => {
                if self.turn_open.swap(false, Ordering::AcqRel) {
                    self.emit(WorkerEvent::MessageEnd {
                        stop_reason: Some("aborted".into()),
                        error_message: None,
                    });
                    self.emit(WorkerEvent::AgentEnd);
                }
            }
            _ => {}
        }
        Ok(WorkerResponse {
            id: None,
            command: name.to_string(),
            success: true,
            data: None,
            error: None,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    async fn stop(&self) {
        self.crash(None);
    }
}

/// Record of one spawn.
#[derive(Clone, Debug)]
pub struct SpawnRecord {
    /// Pool-assigned id.
    pub worker_id: WorkerId,
    /// Profile used.
    pub profile: CapabilityProfile,
    /// Session directory passed.
    pub session_dir: Option<std::path::PathBuf>,
    /// The fake behind the worker.
    pub worker: Arc<FakeWorker>,
}

/// Spawner producing [`FakeWorker`]s.
#[derive(Debug)]
pub struct ScriptedSpawner {
    default_script: Mutex<TurnScript>,
    spawned: Mutex<Vec<SpawnRecord>>,
    fail_next: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl Default for ScriptedSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSpawner {
    /// Spawner whose workers echo prompts.
    pub fn new() -> Self {
        Self::with_default(TurnScript::Echo)
    }

    /// Spawner whose workers play `script` by default.
    pub fn with_default(script: TurnScript) -> Self {
        Self {
            default_script: Mutex::new(script),
            spawned: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Change the default script for workers spawned from now on.
    pub fn set_default_script(&self, script: TurnScript) {
        *self.default_script.lock() = script;
    }

    /// Fail the next `n` spawns.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Delay every spawn.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Number of successful spawns.
    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    /// All spawns so far.
    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.spawned.lock().clone()
    }

    /// Fake behind a worker id.
    pub fn worker(&self, id: &WorkerId) -> Option<Arc<FakeWorker>> {
        self.spawned
            .lock()
            .iter()
            .find(|r| &r.worker_id == id)
            .map(|r| Arc::clone(&r.worker))
    }

    /// Most recently spawned fake.
    pub fn last(&self) -> Option<Arc<FakeWorker>> {
        self.spawned.lock().last().map(|r| Arc::clone(&r.worker))
    }
}

#[async_trait]
impl WorkerSpawner for ScriptedSpawner {
    async fn spawn(&self, request: SpawnRequest<'_>) -> Result<Arc<dyn WorkerConnection>, WorkerError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WorkerError::EarlyExit {
                code: Some(1),
                stderr: "scripted spawn failure".into(),
            });
        }
        let script = self.default_script.lock().clone();
        let worker = Arc::new(FakeWorker::with_default(script));
        self.spawned.lock().push(SpawnRecord {
            worker_id: request.worker_id.clone(),
            profile: request.profile.clone(),
            session_dir: request.session_dir.clone(),
            worker: Arc::clone(&worker),
        });
        Ok(worker)
    }
}
