//! MQTT broker session
//!
//! Split the way the rest of the transport is tested:
//!
//! - [`connection`] - pure state, reconnect policy and broker options
//! - [`message_handler`] - pure classification of event-loop events
//! - [`health_monitor`] - pure reconnection decisions
//! - [`client`] - the session and its supervisor task

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttSession;
pub use connection::{
    configure_mqtt_options, load_root_ca, ConnectionState, MqttError, ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, InboundMessage, MessageForwarder, MessageHandler};
