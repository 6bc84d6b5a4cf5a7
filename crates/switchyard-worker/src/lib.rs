//! # switchyard-worker
//!
//! Everything between the gateway and its worker processes:
//!
//! - [`protocol`]: JSON-lines commands, responses and normalized events
//! - [`client`]: the [`WorkerConnection`] seam and its subprocess implementation
//! - [`stream`]: per-turn event streams
//! - [`profile`]: capability profiles and their reuse signature
//! - [`pool`]: the bounded [`RpcPool`]
//! - [`waiting`]: the [`PoolWaitingList`] backpressure layer
//! - `testing`: scripted in-memory workers (tests and the `testing` feature)

#![deny(unsafe_code)]

pub mod client;
pub mod errors;
pub mod pool;
pub mod profile;
pub mod protocol;
pub mod stream;
pub mod waiting;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{ProcessOptions, ProcessSpawner, ProcessWorker, SpawnRequest, WorkerConnection, WorkerSpawner};
pub use errors::{PoolError, WorkerError};
pub use pool::{PoolConfig, PoolStats, RpcPool, SessionEndListener, SessionEndNotice, SessionEndReason};
pub use profile::{CapabilityProfile, ProfileRequest, ResourceCounts};
pub use protocol::{WorkerCommand, WorkerEvent, WorkerResponse};
pub use stream::{TurnOutput, turn_events};
pub use waiting::{PoolWaitingList, WaitingStats, Waiter};
pub use worker::{WorkerProcess, WorkerSnapshot, WorkerState};
