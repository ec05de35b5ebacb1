//! # campuslink-realtime
//!
//! Real-time connection manager for the campus storefront client.
//!
//! - **Transport**: [`transport::Transport`] trait, a WebSocket adapter and a
//!   scripted test double
//! - **Policy**: [`ReconnectionPolicy`], seedable exponential backoff with jitter
//! - **Queue**: [`OutboundQueue`], ordered buffering of messages emitted
//!   while offline
//! - **Router**: [`EventRouter`], isolated fan-out of inbound events
//! - **Supervisor**: [`ConnectionSupervisor`], the lifecycle state machine
//! - **Store**: [`ConnectionStateStore`], the observable snapshot for UI
//! - **Session**: [`RealtimeSession`], wiring all of the above per user session

#![deny(unsafe_code)]

pub mod heartbeat;
pub mod policy;
pub mod queue;
pub mod router;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use policy::ReconnectionPolicy;
pub use queue::{OutboundQueue, QueuedMessage};
pub use router::{DispatchReport, EventRouter, HandlerResult, Subscription};
pub use session::RealtimeSession;
pub use store::{ConnectionSnapshot, ConnectionStateStore, StoreSubscription};
pub use supervisor::{CommandOutcome, ConnectionSupervisor, EmitOutcome, SupervisorOptions};
pub use transport::{Credentials, Transport, TransportEvent};
