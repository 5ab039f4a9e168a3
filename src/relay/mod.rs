//! Command relay service
//!
//! Cloud-side HTTP shim: a remote control posts a command for a device and
//! the relay hands it to the device registry, which delivers it to the
//! device on its `commands/signal` topic.

pub mod cloudiot;
pub mod server;

pub use cloudiot::{CloudIotCommandSender, CommandSender, RelayError, SendCommandRequest};
pub use server::{relay_command, routes, serve, RelayRequest, RelayResponse};
