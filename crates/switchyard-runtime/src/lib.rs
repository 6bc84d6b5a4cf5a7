//! # switchyard-runtime
//!
//! The message path from channel adapter to worker and back:
//!
//! - [`router`]: agent resolution, session keys and role selection
//! - [`dedup`]: short-window duplicate suppression
//! - [`queue`]: per-session FIFO with collect-mode batching and global caps
//! - [`model_health`]: error classification and model cooldowns
//! - [`hooks`]: lifecycle observers
//! - [`sessions`]: live session state
//! - [`dispatch`]: the [`Gateway`] tying it all together

#![deny(unsafe_code)]

pub mod dedup;
pub mod dispatch;
pub mod errors;
pub mod hooks;
pub mod model_health;
pub mod queue;
pub mod router;
pub mod sessions;

pub use dedup::DeduplicationCache;
pub use dispatch::{DispatchOutcome, Gateway, GatewayStats};
pub use errors::{GatewayError, HookError, QueueError};
pub use hooks::{GatewayHook, HookContext, HookEvent, HookRegistry};
pub use model_health::{ErrorCategory, ModelHealth, ModelHealthTracker, classify_error};
pub use queue::{MessageQueueManager, QueueConfig, QueueEntry, QueueStats, TurnBatch, TurnProcessor};
pub use router::{Route, RouteMatch, SessionRouter};
pub use sessions::{SessionRegistry, SessionState};
