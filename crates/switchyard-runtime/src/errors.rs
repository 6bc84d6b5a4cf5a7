//! Runtime error types.

use switchyard_core::SessionKey;
use switchyard_worker::{PoolError, WorkerError};
use thiserror::Error;

/// Queue admission failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The session already holds `max` pending entries.
    #[error("session {session_key} queue full ({max} pending)")]
    SessionFull {
        /// Session whose queue is full.
        session_key: SessionKey,
        /// Per-session cap.
        max: usize,
    },

    /// The gateway-wide cap is reached and nothing lower-priority can be evicted.
    #[error("gateway queue full ({max} pending)")]
    GlobalFull {
        /// Global cap.
        max: usize,
    },
}

impl QueueError {
    /// Stable snake_case label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::SessionFull { .. } => "session_full",
            Self::GlobalFull { .. } => "global_full",
        }
    }
}

/// Hook handler failures. Logged, never propagated into the pipeline.
#[derive(Debug, Error)]
pub enum HookError {
    /// The handler ran past its timeout.
    #[error("hook '{name}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Handler name.
        name: String,
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The handler returned an error.
    #[error("hook '{name}' failed: {message}")]
    Handler {
        /// Handler name.
        name: String,
        /// Error text.
        message: String,
    },

    /// A handler with the same name is already registered.
    #[error("hook '{0}' already registered")]
    Duplicate(String),
}

/// Failures surfaced by the dispatch pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Pool exhaustion, waiting-list timeout or spawn failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Worker command, timeout or crash.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Queue admission.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Nothing to send.
    #[error("message has no text or images")]
    EmptyMessage,

    /// The gateway is stopping.
    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Stable snake_case label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Pool(e) => e.category(),
            Self::Worker(e) => e.category(),
            Self::Queue(e) => e.category(),
            Self::EmptyMessage => "empty_message",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the sender should simply try again later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Pool(e) => e.is_recoverable(),
            Self::Worker(e) => e.is_recoverable(),
            Self::Queue(_) => true,
            Self::EmptyMessage | Self::ShuttingDown => false,
        }
    }

    /// Short reply text for the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Pool(PoolError::Exhausted { .. } | PoolError::Busy { .. }) => {
                "The assistant is busy right now. Please try again in a moment.".to_string()
            }
            Self::Queue(_) => "Too many messages queued. Please wait.".to_string(),
            Self::Worker(WorkerError::TurnTimeout { .. }) => "The assistant took too long to respond.".to_string(),
            Self::Worker(e) if e.is_crash() => "The assistant stopped unexpectedly. Please try again.".to_string(),
            Self::ShuttingDown | Self::Pool(PoolError::ShuttingDown) => {
                "The gateway is restarting. Please try again shortly.".to_string()
            }
            other => format!("Error: {other}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
