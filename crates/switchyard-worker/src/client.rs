//! Worker subprocess client.
//!
//! [`WorkerConnection`] is the seam the pool talks through; [`ProcessWorker`]
//! is the real implementation over a child process's stdio. Three background
//! tasks serve each process:
//!
//! - **reader**: decodes stdout lines, resolves pending requests by id,
//!   answers `extension_ui_request` headlessly and broadcasts events
//! - **stderr**: keeps a bounded tail for diagnostics
//! - **waiter**: owns the `Child`, records the exit, fails pending requests
//!   and broadcasts a synthetic [`WorkerEvent::Exited`]

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::WorkerId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::WorkerError;
use crate::profile::CapabilityProfile;
use crate::protocol::{Incoming, WorkerCommand, WorkerEvent, WorkerResponse, auto_ui_response, decode_line, encode_request};

/// Stderr bytes kept before trimming.
const STDERR_CAP: usize = 10_000;
/// Stderr bytes kept after trimming.
const STDERR_KEEP: usize = 5_000;
/// Broadcast buffer per worker.
const EVENT_CAPACITY: usize = 1_024;

/// A live connection to one worker.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    /// Send a command and wait for its acknowledgement.
    async fn request(&self, command: WorkerCommand) -> Result<WorkerResponse, WorkerError>;

    /// Subscribe to events. Subscribe before sending a prompt so no event is missed.
    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent>;

    /// Whether the process is still running.
    fn is_alive(&self) -> bool;

    /// OS process id, if any.
    fn pid(&self) -> Option<u32>;

    /// Stop the process (graceful, then forced).
    async fn stop(&self);

    /// Exit code once the process has exited with one.
    fn exit_code(&self) -> Option<i32> {
        None
    }

    /// Recent stderr output.
    fn stderr_tail(&self) -> String {
        String::new()
    }
}

/// Everything needed to start one worker.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    /// Id assigned by the pool.
    pub worker_id: &'a WorkerId,
    /// Invocation profile.
    pub profile: &'a CapabilityProfile,
    /// Directory for the worker's session files.
    pub session_dir: Option<PathBuf>,
}

/// Starts workers. The pool owns one.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker and return once it is ready for commands.
    async fn spawn(&self, request: SpawnRequest<'_>) -> Result<Arc<dyn WorkerConnection>, WorkerError>;
}

/// Timings for subprocess workers.
#[derive(Clone, Debug)]
pub struct ProcessOptions {
    /// Command round-trip timeout.
    pub request_timeout: Duration,
    /// Exiting within this window after spawn is a spawn failure.
    pub startup_grace: Duration,
    /// Time allowed after closing stdin before the process is killed.
    pub stop_grace: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            startup_grace: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessOptions {
    /// Timings from pool settings.
    pub fn from_settings(pool: &switchyard_settings::PoolSettings) -> Self {
        Self {
            request_timeout: Duration::from_millis(pool.request_timeout_ms),
            startup_grace: Duration::from_millis(pool.startup_grace_ms),
            stop_grace: Duration::from_millis(pool.stop_grace_ms),
        }
    }
}

/// Spawns [`ProcessWorker`]s.
#[derive(Clone, Debug, Default)]
pub struct ProcessSpawner {
    options: ProcessOptions,
}

impl ProcessSpawner {
    /// Create a spawner.
    pub fn new(options: ProcessOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, request: SpawnRequest<'_>) -> Result<Arc<dyn WorkerConnection>, WorkerError> {
        let worker = ProcessWorker::spawn(request, self.options.clone()).await?;
        Ok(Arc::new(worker))
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<WorkerResponse>>>>;
type SharedStdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// Worker backed by a child process speaking JSON lines over stdio.
pub struct ProcessWorker {
    id: WorkerId,
    pid: Option<u32>,
    stdin: SharedStdin,
    pending: PendingMap,
    events: broadcast::Sender<WorkerEvent>,
    alive: Arc<AtomicBool>,
    exit: watch::Receiver<Option<Option<i32>>>,
    kill: CancellationToken,
    next_request: AtomicU64,
    stderr: Arc<Mutex<String>>,
    options: ProcessOptions,
}

impl ProcessWorker {
    /// Spawn the process described by `request` and wait out the startup grace.
    pub async fn spawn(request: SpawnRequest<'_>, options: ProcessOptions) -> Result<Self, WorkerError> {
        let profile = request.profile;
        tokio::fs::create_dir_all(&profile.cwd).await?;

        let mut cmd = Command::new(&profile.executable);
        let _ = cmd
            .args(&profile.args)
            .current_dir(&profile.cwd)
            .envs(&profile.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.session_dir {
            tokio::fs::create_dir_all(dir).await?;
            let _ = cmd.arg("--session-dir").arg(dir);
        }

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            executable: profile.executable.clone(),
            source,
        })?;
        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| {
            WorkerError::Io(std::io::Error::other("worker stdout not captured"))
        })?;
        let stderr_pipe = child.stderr.take();
        let stdin: SharedStdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let stderr = Arc::new(Mutex::new(String::new()));

        let worker_id = request.worker_id.clone();
        let reader = tokio::spawn(read_stdout(
            worker_id.clone(),
            stdout,
            Arc::clone(&pending),
            events.clone(),
            Arc::clone(&stdin),
        ));
        let stderr_task = stderr_pipe.map(|pipe| tokio::spawn(read_stderr(pipe, Arc::clone(&stderr))));
        let _waiter = tokio::spawn(wait_for_exit(
            worker_id.clone(),
            child,
            reader,
            kill.clone(),
            Arc::clone(&alive),
            Arc::clone(&pending),
            events.clone(),
            exit_tx,
        ));

        let worker = Self {
            id: worker_id,
            pid,
            stdin,
            pending,
            events,
            alive,
            exit: exit_rx,
            kill,
            next_request: AtomicU64::new(0),
            stderr,
            options,
        };

        let mut exit = worker.exit.clone();
        let early_exit = tokio::time::timeout(worker.options.startup_grace, exit.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(Result::ok)
            .map(|state| (*state).flatten());
        if let Some(code) = early_exit {
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(Duration::from_millis(100), task).await;
            }
            return Err(WorkerError::EarlyExit {
                code,
                stderr: worker.stderr_tail(),
            });
        }

        info!(worker_id = %worker.id, pid, executable = %profile.executable, "worker started");
        Ok(worker)
    }

    /// Worker id.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn write_line(&self, line: &str) -> Result<(), WorkerError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(WorkerError::Exited {
                code: self.exit_code(),
            });
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerConnection for ProcessWorker {
    async fn request(&self, command: WorkerCommand) -> Result<WorkerResponse, WorkerError> {
        if !self.is_alive() {
            return Err(WorkerError::Exited {
                code: self.exit_code(),
            });
        }
        let n = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("req_{n}");
        let line = encode_request(&id, &command)?;

        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(id.clone(), tx);
        if let Err(e) = self.write_line(&line).await {
            let _ = self.pending.lock().remove(&id);
            return Err(e);
        }
        debug!(worker_id = %self.id, request_id = %id, command = command.name(), "sent command");

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(response)) if response.success => Ok(response),
            Ok(Ok(response)) => Err(WorkerError::CommandFailed {
                command: command.name().to_string(),
                message: response.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            Ok(Err(_)) => Err(WorkerError::Exited {
                code: self.exit_code(),
            }),
            Err(_) => {
                let _ = self.pending.lock().remove(&id);
                Err(WorkerError::RequestTimeout {
                    command: command.name().to_string(),
                    timeout_ms: self.options.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn stop(&self) {
        // Closing stdin asks the worker to exit on its own
        drop(self.stdin.lock().await.take());
        let mut exit = self.exit.clone();
        let exited = tokio::time::timeout(self.options.stop_grace, exit.wait_for(Option::is_some))
            .await
            .is_ok();
        if !exited {
            warn!(worker_id = %self.id, "worker ignored stdin close, killing");
            self.kill.cancel();
            let _ = exit.wait_for(Option::is_some).await;
        }
    }

    fn exit_code(&self) -> Option<i32> {
        let state = *self.exit.borrow();
        state.flatten()
    }

    fn stderr_tail(&self) -> String {
        self.stderr.lock().clone()
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl std::fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

async fn read_stdout(
    worker_id: WorkerId,
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    events: broadcast::Sender<WorkerEvent>,
    stdin: SharedStdin,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "worker stdout read failed");
                break;
            }
        };
        match decode_line(&line) {
            Some(Incoming::Response(response)) => {
                let sender = response.id.as_ref().and_then(|id| pending.lock().remove(id));
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(worker_id = %worker_id, id = ?response.id, "response without pending request"),
                }
            }
            Some(Incoming::Event(event)) => {
                if let WorkerEvent::ExtensionUiRequest { id, method, options } = &event {
                    if !id.is_empty() {
                        let reply = auto_ui_response(id, method, options).to_string();
                        if let Some(pipe) = stdin.lock().await.as_mut() {
                            let written = async {
                                pipe.write_all(reply.as_bytes()).await?;
                                pipe.write_all(b"\n").await?;
                                pipe.flush().await
                            }
                            .await;
                            if let Err(e) = written {
                                warn!(worker_id = %worker_id, error = %e, "failed to answer UI request");
                            }
                        }
                        debug!(worker_id = %worker_id, method = %method, "auto-answered UI request");
                    }
                }
                // No receivers is normal between turns
                let _ = events.send(event);
            }
            None => debug!(worker_id = %worker_id, line = %line, "ignoring non-JSON worker output"),
        }
    }
}

async fn read_stderr(pipe: tokio::process::ChildStderr, tail: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = tail.lock();
        buf.push_str(&line);
        buf.push('\n');
        if buf.len() > STDERR_CAP {
            let mut cut = buf.len() - STDERR_KEEP;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            let _ = buf.drain(..cut);
        }
    }
}

async fn wait_for_exit(
    worker_id: WorkerId,
    mut child: Child,
    reader: tokio::task::JoinHandle<()>,
    kill: CancellationToken,
    alive: Arc<AtomicBool>,
    pending: PendingMap,
    events: broadcast::Sender<WorkerEvent>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = status.ok().and_then(|s| s.code());
    // Let the reader drain buffered stdout so events precede the exit notice
    let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
    alive.store(false, Ordering::Release);
    // Dropping the senders fails every in-flight request
    pending.lock().clear();
    info!(worker_id = %worker_id, code, "worker exited");
    let _ = events.send(WorkerEvent::Exited { code });
    let _ = exit_tx.send(Some(code));
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
