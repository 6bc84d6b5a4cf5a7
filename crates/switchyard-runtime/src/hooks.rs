//! Lifecycle hooks.
//!
//! Observers register a [`GatewayHook`] for the events they care about. The
//! pipeline fires events through [`HookRegistry::emit`], which runs handlers
//! in priority order with a per-handler timeout. A failing or slow handler is
//! logged and skipped; it never aborts the pipeline step that fired it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use switchyard_core::SessionKey;
use tracing::{debug, warn};

use crate::errors::HookError;

/// Pipeline lifecycle points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// A message passed dedup and was routed.
    MessageReceived,
    /// First message of a session.
    SessionStart,
    /// A worker is about to receive a turn.
    BeforeAgentStart,
    /// A turn finished (successfully or not).
    AgentEnd,
    /// A reply is about to be delivered.
    MessageSending,
    /// A reply was delivered.
    MessageSent,
    /// A session lost its worker or was reset.
    SessionEnd,
}

/// Payload passed to handlers.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    /// Event.
    pub event: HookEvent,
    /// Session.
    pub session_key: SessionKey,
    /// Agent, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Message or reply text, when relevant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Why the event fired (errors, session-end reasons).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the event fired.
    pub timestamp: DateTime<Utc>,
}

impl HookContext {
    /// Context for `event` on `session_key`.
    pub fn new(event: HookEvent, session_key: &SessionKey) -> Self {
        Self {
            event,
            session_key: session_key.clone(),
            agent_id: None,
            text: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the agent id.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A lifecycle observer.
#[async_trait]
pub trait GatewayHook: Send + Sync {
    /// Unique name.
    fn name(&self) -> &str;

    /// Events this handler wants. Empty means all.
    fn events(&self) -> &[HookEvent] {
        &[]
    }

    /// Higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Handle one event.
    async fn handle(&self, context: &HookContext) -> Result<(), HookError>;
}

/// Registered hooks.
pub struct HookRegistry {
    handlers: RwLock<Vec<Arc<dyn GatewayHook>>>,
    timeout: Duration,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HookRegistry {
    /// Registry with a per-handler timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Add a handler. Names must be unique.
    pub fn register(&self, handler: Arc<dyn GatewayHook>) -> Result<(), HookError> {
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(HookError::Duplicate(handler.name().to_string()));
        }
        handlers.push(handler);
        handlers.sort_by_key(|h| std::cmp::Reverse(h.priority()));
        Ok(())
    }

    /// Remove a handler by name.
    pub fn unregister(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        handlers.len() != before
    }

    /// Number of handlers.
    pub fn count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Run every interested handler. Returns how many failed.
    pub async fn emit(&self, context: HookContext) -> usize {
        let handlers: Vec<Arc<dyn GatewayHook>> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.events().is_empty() || h.events().contains(&context.event))
            .cloned()
            .collect();
        let mut failures = 0;
        for handler in handlers {
            let result = match tokio::time::timeout(self.timeout, handler.handle(&context)).await {
                Ok(result) => result,
                Err(_) => Err(HookError::Timeout {
                    name: handler.name().to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            };
            match result {
                Ok(()) => debug!(hook = handler.name(), event = ?context.event, "hook ran"),
                Err(e) => {
                    failures += 1;
                    warn!(
                        hook = handler.name(),
                        event = ?context.event,
                        session_key = %context.session_key,
                        error = %e,
                        "hook failed"
                    );
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("handlers", &self.count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    struct Recording {
        name: String,
        events: Vec<HookEvent>,
        priority: i32,
        seen: Arc<Mutex<Vec<(String, HookEvent)>>>,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl GatewayHook for Recording {
        fn name(&self) -> &str {
            &self.name
        }
        fn events(&self) -> &[HookEvent] {
            &self.events
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn handle(&self, context: &HookContext) -> Result<(), HookError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().push((self.name.clone(), context.event));
            if self.fail {
                return Err(HookError::Handler {
                    name: self.name.clone(),
                    message: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn hook(name: &str, seen: &Arc<Mutex<Vec<(String, HookEvent)>>>) -> Recording {
        Recording {
            name: name.into(),
            events: vec![],
            priority: 0,
            seen: Arc::clone(seen),
            fail: false,
            delay: None,
        }
    }

    fn ctx(event: HookEvent) -> HookContext {
        HookContext::new(event, &SessionKey::from("s"))
    }

    #[tokio::test]
    async fn runs_in_priority_order_and_filters_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HookRegistry::default();
        registry.register(Arc::new(hook("low", &seen))).unwrap();
        registry
            .register(Arc::new(Recording {
                priority: 10,
                ..hook("high", &seen)
            }))
            .unwrap();
        registry
            .register(Arc::new(Recording {
                events: vec![HookEvent::SessionEnd],
                ..hook("end-only", &seen)
            }))
            .unwrap();

        assert_eq!(registry.emit(ctx(HookEvent::MessageReceived)).await, 0);
        let names: Vec<String> = seen.lock().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HookRegistry::default();
        registry
            .register(Arc::new(Recording {
                fail: true,
                priority: 5,
                ..hook("bad", &seen)
            }))
            .unwrap();
        registry.register(Arc::new(hook("good", &seen))).unwrap();
        assert_eq!(registry.emit(ctx(HookEvent::AgentEnd)).await, 1);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_hooks_time_out() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HookRegistry::new(Duration::from_millis(50));
        registry
            .register(Arc::new(Recording {
                delay: Some(Duration::from_secs(1)),
                ..hook("slow", &seen)
            }))
            .unwrap();
        assert_eq!(registry.emit(ctx(HookEvent::AgentEnd)).await, 1);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn duplicate_names_rejected() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HookRegistry::default();
        registry.register(Arc::new(hook("a", &seen))).unwrap();
        assert_matches!(registry.register(Arc::new(hook("a", &seen))), Err(HookError::Duplicate(_)));
        assert!(registry.unregister("a"));
        assert_eq!(registry.count(), 0);
    }
}
