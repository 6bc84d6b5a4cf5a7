//! Worker and pool error types.

use thiserror::Error;

/// Errors from a single worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The executable could not be started.
    #[error("failed to spawn worker `{executable}`: {source}")]
    Spawn {
        /// Executable that failed to start.
        executable: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The process exited during the startup grace window.
    #[error("worker exited during startup (code {code:?}): {stderr}")]
    EarlyExit {
        /// Exit code, if any.
        code: Option<i32>,
        /// Tail of the worker's stderr.
        stderr: String,
    },

    /// Pipe I/O failed.
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not encode a command.
    #[error("worker protocol encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// No response arrived within the request timeout.
    #[error("worker did not answer `{command}` within {timeout_ms}ms")]
    RequestTimeout {
        /// Command name.
        command: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The worker answered with `success: false`.
    #[error("worker rejected `{command}`: {message}")]
    CommandFailed {
        /// Command name.
        command: String,
        /// Error text reported by the worker.
        message: String,
    },

    /// A turn did not reach `agent_end` in time.
    #[error("turn timed out after {timeout_ms}ms")]
    TurnTimeout {
        /// Turn timeout.
        timeout_ms: u64,
    },

    /// The process exited.
    #[error("worker exited (code {code:?})")]
    Exited {
        /// Exit code, if any.
        code: Option<i32>,
    },
}

impl WorkerError {
    /// Stable snake_case label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::EarlyExit { .. } => "early_exit",
            Self::Io(_) => "io",
            Self::Encode(_) => "encode",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::CommandFailed { .. } => "command_failed",
            Self::TurnTimeout { .. } => "turn_timeout",
            Self::Exited { .. } => "exited",
        }
    }

    /// Whether retrying on the same worker can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::CommandFailed { .. } | Self::TurnTimeout { .. }
        )
    }

    /// Whether this error means the process is gone.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::EarlyExit { .. })
    }
}

/// Errors from the pool and its waiting list.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every worker is bound and no slot can be freed.
    #[error("worker pool at capacity ({max} workers bound)")]
    Exhausted {
        /// Pool maximum.
        max: usize,
    },

    /// Waited too long or the waiting list was full.
    #[error("gateway busy ({reason})")]
    Busy {
        /// Why the wait failed.
        reason: String,
    },

    /// The pool is shutting down.
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// Spawning or resetting a worker failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl PoolError {
    /// Stable snake_case label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "exhausted",
            Self::Busy { .. } => "busy",
            Self::ShuttingDown => "shutting_down",
            Self::Worker(e) => e.category(),
        }
    }

    /// Whether the caller should retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Busy { .. })
    }

    pub(crate) fn busy(reason: impl Into<String>) -> Self {
        Self::Busy {
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_error_categories() {
        let err = WorkerError::TurnTimeout { timeout_ms: 10 };
        assert_eq!(err.category(), "turn_timeout");
        assert!(err.is_recoverable());
        assert!(!err.is_crash());

        let err = WorkerError::Exited { code: Some(1) };
        assert_eq!(err.category(), "exited");
        assert!(!err.is_recoverable());
        assert!(err.is_crash());
    }

    #[test]
    fn pool_error_wraps_worker_error() {
        let err: PoolError = WorkerError::Exited { code: None }.into();
        assert_eq!(err.category(), "exited");
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "worker exited (code None)");
    }

    #[test]
    fn busy_is_recoverable() {
        let err = PoolError::busy("queue timeout");
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "gateway busy (queue timeout)");
    }
}
