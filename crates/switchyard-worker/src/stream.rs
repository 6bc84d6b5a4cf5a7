//! Per-turn event streams.
//!
//! A turn subscribes to its worker's broadcast before the prompt is sent and
//! consumes events through [`turn_events`] until `agent_end`. The stream owns
//! the subscription, so every exit path (completion, timeout, crash, or the
//! consumer dropping it early) unsubscribes.

use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::errors::WorkerError;
use crate::protocol::{DeltaKind, WorkerEvent};

/// Stream a turn's events until [`WorkerEvent::AgentEnd`] (inclusive).
///
/// Fails with [`WorkerError::TurnTimeout`] once `timeout` elapses and with
/// [`WorkerError::Exited`] if the worker dies mid-turn.
pub fn turn_events(
    mut rx: broadcast::Receiver<WorkerEvent>,
    timeout: Duration,
) -> impl Stream<Item = Result<WorkerEvent, WorkerError>> + Send + 'static {
    async_stream::stream! {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    yield Err(WorkerError::TurnTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                    break;
                }
                Ok(Ok(WorkerEvent::Exited { code })) => {
                    yield Err(WorkerError::Exited { code });
                    break;
                }
                Ok(Ok(event)) => {
                    let done = matches!(event, WorkerEvent::AgentEnd);
                    yield Ok(event);
                    if done {
                        break;
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "turn event stream lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    yield Err(WorkerError::Exited { code: None });
                    break;
                }
            }
        }
    }
}

/// Accumulated output of one turn.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TurnOutput {
    /// Assistant text of the current message.
    pub text: String,
    /// Thinking text of the current block.
    pub thinking: String,
    /// Labels of tools the worker ran, in order.
    pub tool_labels: Vec<String>,
    /// Stop reason of the last assistant message.
    pub stop_reason: Option<String>,
    /// Provider error of the last assistant message.
    pub error_message: Option<String>,
    /// Events applied.
    pub event_count: usize,
}

impl TurnOutput {
    /// Fold one event into the output.
    pub fn apply(&mut self, event: &WorkerEvent) {
        self.event_count += 1;
        match event {
            WorkerEvent::MessageUpdate(delta) => match delta.kind {
                DeltaKind::Start => {
                    if let Some(partial) = &delta.partial_text {
                        self.text.clone_from(partial);
                    }
                }
                DeltaKind::TextStart => {
                    self.text = delta.partial_text.clone().unwrap_or_default();
                }
                DeltaKind::TextDelta => {
                    if let Some(d) = &delta.delta {
                        self.text.push_str(d);
                    } else if let Some(partial) = &delta.partial_text {
                        self.text.clone_from(partial);
                    }
                }
                DeltaKind::TextEnd => {
                    if let Some(content) = delta.content.as_ref().or(delta.partial_text.as_ref()) {
                        self.text.clone_from(content);
                    }
                }
                DeltaKind::ThinkingStart => self.thinking.clear(),
                DeltaKind::ThinkingDelta => {
                    if let Some(d) = &delta.delta {
                        self.thinking.push_str(d);
                    }
                }
                DeltaKind::ThinkingEnd | DeltaKind::Other(_) => {}
            },
            WorkerEvent::ToolExecutionStart { label, .. } => {
                if !label.is_empty() {
                    self.tool_labels.push(label.clone());
                }
            }
            WorkerEvent::MessageEnd {
                stop_reason,
                error_message,
            } => {
                if stop_reason.is_some() {
                    self.stop_reason.clone_from(stop_reason);
                }
                if error_message.is_some() {
                    self.error_message.clone_from(error_message);
                }
            }
            _ => {}
        }
    }

    /// Whether the turn produced any text.
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
