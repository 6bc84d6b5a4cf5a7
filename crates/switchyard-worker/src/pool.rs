//! Worker pool.
//!
//! [`RpcPool`] owns every worker process. Sessions acquire a worker keyed by
//! their [`SessionKey`] and a [`CapabilityProfile`]:
//!
//! 1. a worker already bound to the session is returned unconditionally
//! 2. an idle worker with the same signature is bound (one that served this
//!    session last is preferred and keeps its conversation; any other gets a
//!    `new_session` first)
//! 3. below `max`, a new worker is spawned
//! 4. at `max`, the least recently used idle worker is stopped and replaced
//! 5. otherwise the pool is exhausted and callers park in the
//!    [`PoolWaitingList`]
//!
//! Parked callers come first: `release` hands the freed worker (or its slot)
//! to the best waiter before anyone else can see it, and `acquire` refuses
//! new callers while live waiters remain.
//!
//! All bookkeeping happens under one short synchronous lock; process I/O
//! happens outside it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use switchyard_core::metrics::{POOL_EVICTIONS_TOTAL, POOL_EXHAUSTED_TOTAL, POOL_SPAWNS_TOTAL, POOL_WORKERS};
use switchyard_core::{SessionKey, WorkerId};
use switchyard_settings::{GatewaySettings, expand_home};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::{SpawnRequest, WorkerSpawner};
use crate::errors::PoolError;
use crate::profile::CapabilityProfile;
use crate::protocol::WorkerEvent;
use crate::waiting::{PoolWaitingList, WaitingEntry, WaitingStats};
use crate::worker::{WorkerProcess, WorkerSnapshot, WorkerState};

/// Pool bounds and timings.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Workers kept warm.
    pub min: usize,
    /// Hard cap on live workers.
    pub max: usize,
    /// Idle workers above `min` are stopped after this long.
    pub idle_timeout: Duration,
    /// Period of [`RpcPool::maintain`].
    pub maintenance_interval: Duration,
    /// How long a caller may wait for a worker.
    pub wait_ttl: Duration,
    /// Waiting list capacity.
    pub waiting_max: usize,
    /// Root for per-role `--session-dir` directories.
    pub sessions_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            idle_timeout: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(30),
            wait_ttl: Duration::from_secs(30),
            waiting_max: 50,
            sessions_dir: None,
        }
    }
}

impl PoolConfig {
    /// Bounds from settings.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        let pool = &settings.agent.pool;
        Self {
            min: pool.min,
            max: pool.max.max(1),
            idle_timeout: Duration::from_millis(pool.idle_timeout_ms),
            maintenance_interval: Duration::from_millis(pool.maintenance_interval_ms),
            wait_ttl: Duration::from_millis(settings.queue.pool_wait_ttl_ms),
            waiting_max: settings.queue.waiting_list_max,
            sessions_dir: Some(expand_home(&settings.session.data_dir).join("sessions")),
        }
    }
}

/// Why a session lost its worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The worker process exited while bound.
    WorkerExited {
        /// Exit code, if any.
        code: Option<i32>,
    },
    /// The pool shut down while the session was bound.
    Shutdown,
}

/// Notice that a bound session lost its worker.
#[derive(Clone, Debug)]
pub struct SessionEndNotice {
    /// Session that was bound.
    pub session_key: SessionKey,
    /// Worker that served it.
    pub worker_id: WorkerId,
    /// Cause.
    pub reason: SessionEndReason,
    /// Worker stderr tail at exit.
    pub stderr_tail: String,
}

/// Receives [`SessionEndNotice`]s. Called synchronously from the pool; spawn
/// if the handling is async.
pub trait SessionEndListener: Send + Sync {
    /// A bound session lost its worker.
    fn session_ended(&self, notice: SessionEndNotice);
}

/// Pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Live workers.
    pub total: usize,
    /// Workers bound to a session.
    pub active: usize,
    /// Idle workers.
    pub idle: usize,
    /// Spawns in flight.
    pub spawning: usize,
    /// Callers in the waiting list.
    pub waiting: usize,
    /// Configured maximum.
    pub max_capacity: usize,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, Arc<WorkerProcess>>,
    bindings: HashMap<SessionKey, WorkerId>,
    spawning: usize,
}

impl PoolState {
    fn bound_to(&self, session_key: &SessionKey) -> Option<Arc<WorkerProcess>> {
        let id = self.bindings.get(session_key)?;
        self.workers.get(id).cloned()
    }

    fn bind(&mut self, worker: &Arc<WorkerProcess>, session_key: &SessionKey) {
        worker.bind(session_key);
        let _ = self.bindings.insert(session_key.clone(), worker.id().clone());
    }

    /// Remove a worker and its binding. Returns the session it was bound to.
    fn remove(&mut self, id: &WorkerId) -> Option<(Arc<WorkerProcess>, Option<SessionKey>)> {
        let worker = self.workers.remove(id)?;
        let session = worker.mark_dead();
        if let Some(key) = &session {
            if self.bindings.get(key) == Some(id) {
                let _ = self.bindings.remove(key);
            }
        }
        Some((worker, session))
    }

    /// Idle worker for a profile, preferring the one that served `session_key` last.
    fn idle_match(&self, session_key: &SessionKey, signature: &str) -> Option<Arc<WorkerProcess>> {
        let candidates = self.workers.values().filter(|w| {
            w.state() == WorkerState::Idle && w.is_alive() && !w.is_stale() && w.signature() == signature
        });
        let mut fallback = None;
        for worker in candidates {
            if worker.last_session().as_ref() == Some(session_key) {
                return Some(Arc::clone(worker));
            }
            if fallback.is_none() {
                fallback = Some(Arc::clone(worker));
            }
        }
        fallback
    }

    fn least_recent_idle(&self, now: Instant) -> Option<Arc<WorkerProcess>> {
        self.workers
            .values()
            .filter(|w| w.state() == WorkerState::Idle)
            .max_by_key(|w| w.idle_for(now))
            .cloned()
    }

    /// Claim capacity for `session_key`: a live binding, a matching idle
    /// worker, a free spawn slot, or the slot of the least recently used idle
    /// worker. Everything is reserved before the lock is released.
    fn plan(&mut self, max: usize, session_key: &SessionKey, profile: &CapabilityProfile) -> Result<Plan, PoolError> {
        if let Some(worker) = self.bound_to(session_key) {
            if worker.is_alive() {
                return Ok(Plan::Reuse { worker, reset: false });
            }
        }

        if let Some(worker) = self.idle_match(session_key, &profile.signature) {
            let reset = worker.last_session().is_some_and(|last| &last != session_key);
            self.bind(&worker, session_key);
            self.publish();
            return Ok(Plan::Reuse { worker, reset });
        }

        if self.workers.len() + self.spawning < max {
            self.spawning += 1;
            self.publish();
            return Ok(Plan::Spawn { evict: None });
        }

        if let Some(victim) = self.least_recent_idle(Instant::now()) {
            let evicted = self.remove(victim.id()).map(|(w, _)| w);
            self.spawning += 1;
            self.publish();
            return Ok(Plan::Spawn { evict: evicted });
        }

        Err(PoolError::Exhausted { max })
    }

    fn stats(&self) -> (usize, usize) {
        let active = self
            .workers
            .values()
            .filter(|w| w.state() == WorkerState::Bound)
            .count();
        (active, self.workers.len() - active)
    }

    fn publish(&self) {
        let (active, idle) = self.stats();
        gauge!(POOL_WORKERS, "state" => "bound").set(active as f64);
        gauge!(POOL_WORKERS, "state" => "idle").set(idle as f64);
        gauge!(POOL_WORKERS, "state" => "spawning").set(self.spawning as f64);
    }
}

enum Plan {
    Reuse { worker: Arc<WorkerProcess>, reset: bool },
    Spawn { evict: Option<Arc<WorkerProcess>> },
}

/// Capacity reserved for a waiter, to be completed outside the lock.
struct Handoff {
    entry: WaitingEntry,
    plan: Plan,
}

/// What unbinding a session left to do outside the lock.
#[derive(Default)]
struct Detached {
    retired: Option<Arc<WorkerProcess>>,
    ended: Option<SessionEndNotice>,
    handoff: Option<Handoff>,
}

struct PoolInner {
    config: RwLock<PoolConfig>,
    spawner: Arc<dyn WorkerSpawner>,
    state: Mutex<PoolState>,
    waiting: PoolWaitingList,
    listener: RwLock<Option<Arc<dyn SessionEndListener>>>,
    prewarm: RwLock<Option<Arc<CapabilityProfile>>>,
    shutdown: CancellationToken,
}

/// Bounded pool of worker processes. Cheap to clone.
#[derive(Clone)]
pub struct RpcPool {
    inner: Arc<PoolInner>,
}

impl RpcPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let waiting = PoolWaitingList::new(config.waiting_max);
        Self {
            inner: Arc::new(PoolInner {
                config: RwLock::new(config),
                spawner,
                state: Mutex::new(PoolState::default()),
                waiting,
                listener: RwLock::new(None),
                prewarm: RwLock::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register the session-end listener.
    pub fn set_session_end_listener(&self, listener: Arc<dyn SessionEndListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Profile used to keep `min` workers warm.
    pub fn set_prewarm_profile(&self, profile: Arc<CapabilityProfile>) {
        *self.inner.prewarm.write() = Some(profile);
    }

    /// Current configuration.
    pub fn config(&self) -> PoolConfig {
        self.inner.config.read().clone()
    }

    /// The waiting list.
    pub fn waiting_list(&self) -> &PoolWaitingList {
        &self.inner.waiting
    }

    /// Worker bound to `session_key`, without acquiring.
    pub fn get_for_session(&self, session_key: &SessionKey) -> Option<Arc<WorkerProcess>> {
        self.inner.state.lock().bound_to(session_key)
    }

    /// Bind the worker that is bound to, or last served, `session_key`
    /// without spawning. Used to act on a session's conversation (reset)
    /// outside a turn.
    pub fn claim_for_session(&self, session_key: &SessionKey) -> Option<Arc<WorkerProcess>> {
        let mut state = self.inner.state.lock();
        if let Some(worker) = state.bound_to(session_key) {
            return Some(worker);
        }
        let worker = state
            .workers
            .values()
            .find(|w| {
                w.state() == WorkerState::Idle && w.is_alive() && w.last_session().as_ref() == Some(session_key)
            })
            .cloned()?;
        state.bind(&worker, session_key);
        state.publish();
        Some(worker)
    }

    /// Bind a worker to `session_key`, failing with [`PoolError::Exhausted`]
    /// when every worker is bound or callers are already waiting.
    #[instrument(skip_all, fields(session_key = %session_key, signature = %profile.short_signature()))]
    pub async fn acquire(
        &self,
        session_key: &SessionKey,
        profile: &Arc<CapabilityProfile>,
    ) -> Result<Arc<WorkerProcess>, PoolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        self.reap_dead_binding(session_key);
        let plan = {
            let max = self.inner.config.read().max;
            let mut state = self.inner.state.lock();
            match state.bound_to(session_key) {
                Some(worker) => Plan::Reuse { worker, reset: false },
                // Waiters get freed capacity before newcomers
                None if self.inner.waiting.has_live() => return Err(PoolError::Exhausted { max }),
                None => state.plan(max, session_key, profile)?,
            }
        };
        self.complete(session_key, profile, plan).await
    }

    /// [`acquire`](Self::acquire), parking in the waiting list when the pool
    /// is exhausted.
    pub async fn acquire_or_wait(
        &self,
        session_key: &SessionKey,
        profile: &Arc<CapabilityProfile>,
        priority: i32,
    ) -> Result<Arc<WorkerProcess>, PoolError> {
        match self.acquire(session_key, profile).await {
            Err(PoolError::Exhausted { max }) => {
                counter!(POOL_EXHAUSTED_TOTAL).increment(1);
                let ttl = self.inner.config.read().wait_ttl;
                debug!(session_key = %session_key, max, priority, "pool exhausted, waiting");
                let waiter = self
                    .inner
                    .waiting
                    .enqueue(session_key.clone(), Arc::clone(profile), priority, ttl)?;
                // Capacity may have freed up between the failed acquire and enqueue
                self.kick_waiting();
                waiter.wait().await
            }
            other => other,
        }
    }

    /// Unbind the session's worker. The highest priority waiter gets it (or
    /// its slot) before anyone else can; otherwise it goes back to the idle
    /// set. Stale or dead workers are removed instead.
    #[instrument(skip_all, fields(session_key = %session_key))]
    pub async fn release(&self, session_key: &SessionKey) {
        let detached = self.detach(session_key);
        if let Some(handoff) = detached.handoff {
            let pool = self.clone();
            let _ = tokio::spawn(async move { pool.serve(handoff).await });
        }
        self.settle_detached(detached.ended, detached.retired).await;
    }

    /// Release the session's worker and stop it rather than keep it.
    pub async fn discard(&self, session_key: &SessionKey) {
        if let Some(worker) = self.get_for_session(session_key) {
            info!(worker_id = %worker.id(), session_key = %session_key, "discarding worker");
            worker.mark_stale();
        }
        self.release(session_key).await;
    }

    fn detach(&self, session_key: &SessionKey) -> Detached {
        let max = self.inner.config.read().max;
        let mut state = self.inner.state.lock();
        let Some(id) = state.bindings.remove(session_key) else {
            return Detached::default();
        };
        let Some(worker) = state.workers.get(&id).cloned() else {
            return Detached::default();
        };
        let _ = worker.unbind();

        let mut detached = Detached::default();
        if !worker.is_alive() {
            // The exit watch finds nothing left, so the notice goes out here
            detached.ended = Some(SessionEndNotice {
                session_key: session_key.clone(),
                worker_id: id.clone(),
                reason: SessionEndReason::WorkerExited {
                    code: worker.exit_code(),
                },
                stderr_tail: worker.stderr_tail(),
            });
            let _ = state.remove(&id);
        } else if worker.is_stale() {
            info!(worker_id = %id, "retiring stale worker at release");
            detached.retired = state.remove(&id).map(|(w, _)| w);
        } else {
            debug!(worker_id = %id, "worker idle");
        }
        detached.handoff = self.offer_locked(&mut state, max);
        state.publish();
        detached
    }

    /// Reserve capacity for the next live waiter, if there is any to give.
    fn offer_locked(&self, state: &mut PoolState, max: usize) -> Option<Handoff> {
        if self.inner.shutdown.is_cancelled() {
            return None;
        }
        let entry = self.inner.waiting.pop_next()?;
        match state.plan(max, &entry.session_key, &entry.profile) {
            Ok(plan) => Some(Handoff { entry, plan }),
            Err(_) => {
                self.inner.waiting.requeue(entry);
                None
            }
        }
    }

    fn offer(&self) -> Option<Handoff> {
        let max = self.inner.config.read().max;
        let mut state = self.inner.state.lock();
        self.offer_locked(&mut state, max)
    }

    fn kick_waiting(&self) {
        if let Some(handoff) = self.offer() {
            let pool = self.clone();
            let _ = tokio::spawn(async move { pool.serve(handoff).await });
        }
    }

    /// Complete reserved handoffs until no waiter can be served.
    async fn serve(&self, first: Handoff) {
        let mut next = Some(first);
        while let Some(Handoff { entry, plan }) = next.take() {
            let session_key = entry.session_key.clone();
            let profile = Arc::clone(&entry.profile);
            let waited_ms = entry.enqueued_at.elapsed().as_millis() as u64;
            match self.complete(&session_key, &profile, plan).await {
                Ok(worker) => {
                    if entry.grant(worker).is_none() {
                        self.inner.waiting.record_drained();
                        debug!(session_key = %session_key, waited_ms, "granted worker to waiter");
                    } else {
                        debug!(session_key = %session_key, "waiter left before its grant");
                        let detached = self.detach(&session_key);
                        next = detached.handoff;
                        self.settle_detached(detached.ended, detached.retired).await;
                        continue;
                    }
                }
                Err(e) => entry.fail(e),
            }
            next = self.offer();
        }
    }

    async fn settle_detached(&self, ended: Option<SessionEndNotice>, retired: Option<Arc<WorkerProcess>>) {
        if let Some(notice) = ended {
            warn!(worker_id = %notice.worker_id, session_key = %notice.session_key, "worker exited during turn");
            self.notify_session_end(notice);
        }
        if let Some(worker) = retired {
            worker.stop().await;
        }
    }

    /// Turn a reserved plan into a ready, bound worker.
    async fn complete(
        &self,
        session_key: &SessionKey,
        profile: &Arc<CapabilityProfile>,
        plan: Plan,
    ) -> Result<Arc<WorkerProcess>, PoolError> {
        match plan {
            Plan::Reuse { worker, reset } => {
                if reset {
                    if let Err(e) = worker.new_session().await {
                        warn!(worker_id = %worker.id(), error = %e, "conversation reset failed, retiring worker");
                        self.retire(worker.id()).await;
                        return Err(e.into());
                    }
                    worker.initialize().await;
                }
                debug!(worker_id = %worker.id(), reset, "reused idle worker");
                Ok(worker)
            }
            Plan::Spawn { evict } => {
                if let Some(old) = evict {
                    counter!(POOL_EVICTIONS_TOTAL, "reason" => "capacity").increment(1);
                    info!(worker_id = %old.id(), "stopping idle worker to make room");
                    old.stop().await;
                }
                let worker = self.spawn_worker(profile).await?;
                let raced = {
                    let mut state = self.inner.state.lock();
                    match state.bound_to(session_key) {
                        Some(bound) => Some(bound),
                        None => {
                            state.bind(&worker, session_key);
                            state.publish();
                            None
                        }
                    }
                };
                if let Some(bound) = raced {
                    // A concurrent acquire won; ours stays idle for whoever waits
                    self.kick_waiting();
                    return Ok(bound);
                }
                worker.initialize().await;
                Ok(worker)
            }
        }
    }

    /// Drop a binding whose worker already died, announcing the session end.
    fn reap_dead_binding(&self, session_key: &SessionKey) {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.bound_to(session_key) {
                Some(worker) if !worker.is_alive() => {
                    let removed = state.remove(worker.id());
                    state.publish();
                    removed
                }
                _ => None,
            }
        };
        if let Some((worker, Some(session_key))) = removed {
            self.notify_session_end(SessionEndNotice {
                session_key,
                worker_id: worker.id().clone(),
                reason: SessionEndReason::WorkerExited {
                    code: worker.exit_code(),
                },
                stderr_tail: worker.stderr_tail(),
            });
        }
    }

    /// Spawn a worker and add it to the pool as idle. The caller must have
    /// reserved a slot in `spawning`.
    async fn spawn_worker(&self, profile: &Arc<CapabilityProfile>) -> Result<Arc<WorkerProcess>, PoolError> {
        let id = WorkerId::new();
        let session_dir = self
            .inner
            .config
            .read()
            .sessions_dir
            .as_ref()
            .map(|dir| dir.join(&profile.role));
        let spawned = self
            .inner
            .spawner
            .spawn(SpawnRequest {
                worker_id: &id,
                profile,
                session_dir,
            })
            .await;

        let worker = {
            let mut state = self.inner.state.lock();
            state.spawning = state.spawning.saturating_sub(1);
            let connection = match spawned {
                Ok(connection) => connection,
                Err(e) => {
                    state.publish();
                    warn!(error = %e, role = %profile.role, "worker spawn failed");
                    return Err(e.into());
                }
            };
            let worker = Arc::new(WorkerProcess::new(id.clone(), Arc::clone(profile), connection));
            if !self.inner.shutdown.is_cancelled() {
                let _ = state.workers.insert(id.clone(), Arc::clone(&worker));
            }
            state.publish();
            worker
        };
        if self.inner.shutdown.is_cancelled() {
            worker.stop().await;
            return Err(PoolError::ShuttingDown);
        }

        counter!(POOL_SPAWNS_TOTAL).increment(1);
        info!(worker_id = %id, pid = worker.pid(), role = %profile.role, signature = %profile.short_signature(), "worker added to pool");
        self.watch_exit(&worker);
        Ok(worker)
    }

    fn watch_exit(&self, worker: &Arc<WorkerProcess>) {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let mut rx = worker.subscribe();
        let id = worker.id().clone();
        let _ = tokio::spawn(async move {
            let code = loop {
                match rx.recv().await {
                    Ok(WorkerEvent::Exited { code }) => break code,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break None,
                }
            };
            if let Some(inner) = pool.upgrade() {
                RpcPool { inner }.handle_exit(&id, code);
            }
        });
    }

    /// Remove an exited worker, notify its session and let waiters in.
    fn handle_exit(&self, id: &WorkerId, code: Option<i32>) {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.remove(id);
            state.publish();
            removed
        };
        let Some((worker, session)) = removed else {
            return;
        };
        warn!(worker_id = %id, code, session_key = ?session, "worker exited");
        if let Some(session_key) = session {
            self.notify_session_end(SessionEndNotice {
                session_key,
                worker_id: id.clone(),
                reason: SessionEndReason::WorkerExited { code },
                stderr_tail: worker.stderr_tail(),
            });
        }
        self.kick_waiting();
    }

    fn notify_session_end(&self, notice: SessionEndNotice) {
        let listener = self.inner.listener.read().clone();
        if let Some(listener) = listener {
            listener.session_ended(notice);
        }
    }

    async fn retire(&self, id: &WorkerId) {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.remove(id);
            state.publish();
            removed
        };
        if let Some((worker, _)) = removed {
            worker.stop().await;
        }
        self.kick_waiting();
    }

    /// One maintenance pass: reap dead workers, stop idle ones past the idle
    /// timeout down to `min`, then pre-warm up to `min`.
    pub async fn maintain(&self) {
        let config = self.config();

        let dead: Vec<WorkerId> = {
            let state = self.inner.state.lock();
            state
                .workers
                .values()
                .filter(|w| !w.is_alive())
                .map(|w| w.id().clone())
                .collect()
        };
        for id in dead {
            self.handle_exit(&id, None);
        }

        let expired = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let mut idle: Vec<Arc<WorkerProcess>> = state
                .workers
                .values()
                .filter(|w| w.state() == WorkerState::Idle && w.idle_for(now) >= config.idle_timeout)
                .cloned()
                .collect();
            idle.sort_by_key(|w| std::cmp::Reverse(w.idle_for(now)));
            let surplus = state.workers.len().saturating_sub(config.min);
            let mut expired = Vec::new();
            for worker in idle.into_iter().take(surplus) {
                if let Some((w, _)) = state.remove(worker.id()) {
                    expired.push(w);
                }
            }
            state.publish();
            expired
        };
        for worker in expired {
            counter!(POOL_EVICTIONS_TOTAL, "reason" => "idle").increment(1);
            info!(worker_id = %worker.id(), "stopping idle worker");
            worker.stop().await;
        }

        self.prewarm().await;
        self.kick_waiting();
    }

    async fn prewarm(&self) {
        let Some(profile) = self.inner.prewarm.read().clone() else {
            return;
        };
        let min = self.inner.config.read().min;
        loop {
            {
                let mut state = self.inner.state.lock();
                if self.inner.shutdown.is_cancelled() || state.workers.len() + state.spawning >= min {
                    return;
                }
                state.spawning += 1;
            }
            if let Err(e) = self.spawn_worker(&profile).await {
                warn!(error = %e, "pre-warm spawn failed");
                return;
            }
        }
    }

    /// Run [`maintain`](Self::maintain) periodically until shutdown.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let period = pool.config().maintenance_interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = pool.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.maintain().await,
                }
            }
            debug!("pool maintenance stopped");
        })
    }

    /// Apply new bounds after a settings reload. Idle workers are stopped,
    /// bound ones are flagged and replaced at release.
    pub async fn reload(&self, config: PoolConfig) {
        *self.inner.config.write() = config;
        let idle = {
            let mut state = self.inner.state.lock();
            let ids: Vec<WorkerId> = state.workers.keys().cloned().collect();
            let mut idle = Vec::new();
            for id in ids {
                let Some(worker) = state.workers.get(&id).cloned() else {
                    continue;
                };
                if worker.state() == WorkerState::Bound {
                    worker.mark_stale();
                } else if let Some((w, _)) = state.remove(&id) {
                    idle.push(w);
                }
            }
            state.publish();
            idle
        };
        info!(stopped = idle.len(), "pool reloaded");
        let _ = join_all(idle.iter().map(|w| w.stop())).await;
        self.kick_waiting();
    }

    /// Counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let (active, idle) = state.stats();
        PoolStats {
            total: state.workers.len(),
            active,
            idle,
            spawning: state.spawning,
            waiting: self.inner.waiting.len(),
            max_capacity: self.inner.config.read().max,
        }
    }

    /// Waiting list counters.
    pub fn waiting_stats(&self) -> WaitingStats {
        self.inner.waiting.stats()
    }

    /// Per-worker snapshots.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        let state = self.inner.state.lock();
        let mut workers: Vec<WorkerSnapshot> = state.workers.values().map(|w| w.snapshot()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Fail all waiters and stop every worker.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let cancelled = self.inner.waiting.cancel_all("gateway shutting down");
        let removed: Vec<(Arc<WorkerProcess>, Option<SessionKey>)> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<WorkerId> = state.workers.keys().cloned().collect();
            let removed = ids.iter().filter_map(|id| state.remove(id)).collect();
            state.publish();
            removed
        };
        info!(workers = removed.len(), waiters = cancelled, "shutting down worker pool");
        for (worker, session) in &removed {
            if let Some(session_key) = session {
                self.notify_session_end(SessionEndNotice {
                    session_key: session_key.clone(),
                    worker_id: worker.id().clone(),
                    reason: SessionEndReason::Shutdown,
                    stderr_tail: String::new(),
                });
            }
        }
        let _ = join_all(removed.iter().map(|(w, _)| w.stop())).await;
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for RpcPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPool").field("stats", &self.stats()).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
