//! Observability for the device agent and the command relay
//!
//! Structured logging only: `tracing` spans and events rendered by
//! `tracing-subscriber` in JSON, pretty or compact form.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
