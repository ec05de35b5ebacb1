//! # campuslink-core
//!
//! Foundation types, errors, branded IDs, and utilities for campuslink.
//!
//! This crate provides the shared vocabulary that the other campuslink crates
//! depend on:
//!
//! - **Branded IDs**: `MessageId`, `SubscriberId` as newtypes for type safety
//! - **Connection state**: [`ConnectionState`] and its legal transition edges
//! - **Errors**: per-domain `thiserror` enums, plus the UI-facing
//!   [`ConnectionError`] record
//! - **Backoff**: exponential backoff with jitter in [`retry`]
//! - **Logging**: `tracing` subscriber setup and test capture helpers

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod state;

pub use errors::{ConnectionError, HandlerError, QueueError, TransportError};
pub use ids::{MessageId, SubscriberId};
pub use state::{ConnectionState, StateTransition};
