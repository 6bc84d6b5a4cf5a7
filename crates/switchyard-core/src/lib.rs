//! # switchyard-core
//!
//! Foundation types shared by every switchyard crate.
//!
//! - [`SessionKey`] / [`WorkerId`]: identity newtypes
//! - [`InboundMessage`], [`MessageSource`], [`Responder`]: the narrow interface
//!   channel adapters use to hand work to the gateway
//! - [`logging`]: `tracing` subscriber setup
//! - [`metrics`]: metric name constants shared across crates

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod message;
pub mod metrics;

pub use ids::{SessionKey, WorkerId};
pub use message::{
    ChatType, ImageContent, InboundMessage, MessageSource, Responder, ResponderError,
};
