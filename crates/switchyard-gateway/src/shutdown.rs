//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use switchyard_runtime::Gateway;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Time allowed for the pool to stop and background tasks to finish.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Fans a single stop signal out to the stdio reader, the reload loop and the
/// gateway.
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// New coordinator, not yet triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by long-running tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger on Ctrl-C (and SIGTERM on unix).
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = wait_for_signal() => {
                    info!("shutdown signal received");
                    token.cancel();
                }
            }
        })
    }

    /// Stop the gateway and join `handles`, aborting whatever is still
    /// running once `timeout` has passed.
    pub async fn drain(&self, gateway: &Gateway, handles: Vec<JoinHandle<()>>, timeout: Duration) {
        self.trigger();
        info!(task_count = handles.len(), timeout_secs = timeout.as_secs(), "draining gateway");

        if tokio::time::timeout(timeout, gateway.shutdown()).await.is_err() {
            warn!("worker pool did not stop within {timeout:?}");
        }

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles)).await.is_err() {
            warn!("background tasks still running after {timeout:?}, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
