//! Device identity, topic templates and wire payloads
//!
//! Everything here is pure data: no I/O, no async.

pub mod identity;
pub mod messages;
pub mod topics;

pub use identity::*;
pub use messages::*;
pub use topics::*;
