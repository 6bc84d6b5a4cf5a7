//! Backpressure in front of the pool.
//!
//! When `acquire` finds the pool exhausted, the caller parks a [`Waiter`]
//! here. Entries drain highest priority first, FIFO within a priority. Each
//! waiter enforces its own TTL and removes its entry on expiry or drop, so an
//! entry never outlives its deadline. A grant that races with expiry finds
//! the receiver gone and hands the worker back to the pool.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use switchyard_core::SessionKey;
use switchyard_core::metrics::{POOL_WAIT_EXPIRED_TOTAL, POOL_WAITING};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::PoolError;
use crate::profile::CapabilityProfile;
use crate::worker::WorkerProcess;

type Grant = Result<Arc<WorkerProcess>, PoolError>;

/// Waiting list counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingStats {
    /// Entries currently waiting.
    pub waiting: usize,
    /// Entries ever admitted.
    pub total_enqueued: u64,
    /// Entries granted a worker.
    pub total_drained: u64,
    /// Entries that hit their TTL.
    pub total_expired: u64,
    /// Entries refused or evicted because the list was full.
    pub total_rejected: u64,
}

/// A caller parked until a worker frees up.
pub(crate) struct WaitingEntry {
    seq: u64,
    pub(crate) session_key: SessionKey,
    pub(crate) profile: Arc<CapabilityProfile>,
    pub(crate) priority: i32,
    pub(crate) enqueued_at: Instant,
    tx: oneshot::Sender<Grant>,
}

impl WaitingEntry {
    /// Whether the waiter has given up.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hand over a worker. Gives it back if the waiter is gone.
    pub(crate) fn grant(self, worker: Arc<WorkerProcess>) -> Option<Arc<WorkerProcess>> {
        self.tx.send(Ok(worker)).err().and_then(Result::ok)
    }

    /// Fail the waiter.
    pub(crate) fn fail(self, error: PoolError) {
        let _ = self.tx.send(Err(error));
    }
}

#[derive(Default)]
struct WaitingState {
    /// Sorted by priority descending, then sequence ascending.
    entries: Vec<WaitingEntry>,
    next_seq: u64,
    stats: WaitingStats,
}

impl WaitingState {
    fn insert(&mut self, entry: WaitingEntry) {
        let at = self
            .entries
            .partition_point(|e| e.priority > entry.priority || (e.priority == entry.priority && e.seq < entry.seq));
        self.entries.insert(at, entry);
    }

    fn remove(&mut self, seq: u64) -> Option<WaitingEntry> {
        let at = self.entries.iter().position(|e| e.seq == seq)?;
        Some(self.entries.remove(at))
    }

    fn publish(&mut self) {
        self.stats.waiting = self.entries.len();
        gauge!(POOL_WAITING).set(self.entries.len() as f64);
    }
}

/// Priority-ordered, TTL-bounded waiting list.
#[derive(Clone)]
pub struct PoolWaitingList {
    state: Arc<Mutex<WaitingState>>,
    max_size: usize,
}

impl PoolWaitingList {
    /// Create a list holding at most `max_size` waiters.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(WaitingState::default())),
            max_size: max_size.max(1),
        }
    }

    /// Park a caller. Fails immediately with [`PoolError::Busy`] when the
    /// list is full and `priority` does not beat the lowest entry.
    pub fn enqueue(
        &self,
        session_key: SessionKey,
        profile: Arc<CapabilityProfile>,
        priority: i32,
        ttl: Duration,
    ) -> Result<Waiter, PoolError> {
        let (tx, rx) = oneshot::channel();
        let (seq, evicted) = {
            let mut state = self.state.lock();
            let mut evicted = None;
            if state.entries.len() >= self.max_size {
                let lowest = state.entries.last().map_or(i32::MIN, |e| e.priority);
                if priority <= lowest {
                    state.stats.total_rejected += 1;
                    return Err(PoolError::busy("waiting list full"));
                }
                evicted = state.entries.pop();
                state.stats.total_rejected += 1;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.insert(WaitingEntry {
                seq,
                session_key: session_key.clone(),
                profile,
                priority,
                enqueued_at: Instant::now(),
                tx,
            });
            state.stats.total_enqueued += 1;
            state.publish();
            (seq, evicted)
        };
        if let Some(entry) = evicted {
            warn!(session_key = %entry.session_key, priority = entry.priority, "evicted from waiting list");
            entry.fail(PoolError::busy("displaced by higher priority"));
        }
        debug!(session_key = %session_key, priority, ttl_ms = ttl.as_millis() as u64, "waiting for a worker");
        Ok(Waiter {
            list: self.clone(),
            seq,
            session_key,
            deadline: Instant::now() + ttl,
            rx: Some(rx),
        })
    }

    /// Remove the entry that should be served next.
    pub(crate) fn pop_next(&self) -> Option<WaitingEntry> {
        let mut state = self.state.lock();
        loop {
            if state.entries.is_empty() {
                state.publish();
                return None;
            }
            let entry = state.entries.remove(0);
            if entry.is_abandoned() {
                continue;
            }
            state.publish();
            return Some(entry);
        }
    }

    /// Put an entry back in its original position. An entry whose waiter
    /// gave up while it was out of the list is dropped instead.
    pub(crate) fn requeue(&self, entry: WaitingEntry) {
        let mut state = self.state.lock();
        if entry.is_abandoned() {
            state.stats.total_expired += 1;
            debug!(session_key = %entry.session_key, "waiter left while being served, dropping entry");
        } else {
            state.insert(entry);
        }
        state.publish();
    }

    /// Whether any waiter is still waiting.
    pub(crate) fn has_live(&self) -> bool {
        self.state.lock().entries.iter().any(|e| !e.is_abandoned())
    }

    pub(crate) fn record_drained(&self) {
        self.state.lock().stats.total_drained += 1;
    }

    /// Fail every waiter.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let entries = {
            let mut state = self.state.lock();
            let entries = std::mem::take(&mut state.entries);
            state.publish();
            entries
        };
        let count = entries.len();
        for entry in entries {
            entry.fail(PoolError::busy(reason));
        }
        count
    }

    /// Current number of waiters.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters.
    pub fn stats(&self) -> WaitingStats {
        let state = self.state.lock();
        WaitingStats {
            waiting: state.entries.len(),
            ..state.stats
        }
    }

    fn expire(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove(seq).is_some();
        if removed {
            state.stats.total_expired += 1;
            state.publish();
        }
        removed
    }

    fn forget(&self, seq: u64) {
        let mut state = self.state.lock();
        if state.remove(seq).is_some() {
            state.publish();
        }
    }
}

impl std::fmt::Debug for PoolWaitingList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolWaitingList")
            .field("waiting", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Handle to one parked caller. Dropping it withdraws the entry.
pub struct Waiter {
    list: PoolWaitingList,
    seq: u64,
    session_key: SessionKey,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Grant>>,
}

impl Waiter {
    /// Wait for a worker until the TTL elapses.
    pub async fn wait(mut self) -> Result<Arc<WorkerProcess>, PoolError> {
        let Some(rx) = self.rx.take() else {
            return Err(PoolError::busy("waiter already used"));
        };
        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                if self.list.expire(self.seq) {
                    counter!(POOL_WAIT_EXPIRED_TOTAL).increment(1);
                    warn!(session_key = %self.session_key, "gave up waiting for a worker");
                }
                Err(PoolError::busy("timed out waiting for a worker"))
            }
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("session_key", &self.session_key)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.list.forget(self.seq);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
