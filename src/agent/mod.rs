//! Device agent: command forwarding, state publishing and lifecycle
//!
//! The lifecycle owns the broker session, subscribes the device topics with
//! the handlers from [`handlers`], and drives the [`state`] publisher.

pub mod forwarder;
pub mod handlers;
pub mod lifecycle;
pub mod state;

pub use forwarder::{CommandForwarder, SignalHandler};
pub use handlers::{device_subscriptions, CommandsHandler, LogHandler};
pub use lifecycle::{AgentLifecycle, LifecycleError, LifecyclePhase, StopReason};
pub use state::{HeartbeatTicker, StatePublisher};
