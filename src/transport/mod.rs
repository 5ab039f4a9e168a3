//! Transport layer for the device session
//!
//! The [`Transport`] trait is the seam between the lifecycle and the broker:
//! production uses [`mqtt::MqttSession`], tests use
//! [`crate::testing::mocks::MockTransport`].

use crate::error::AgentError;
use crate::routing::TopicSubscription;
use rumqttc::QoS;
use std::time::Duration;
use tokio::sync::watch;

pub mod mqtt;

pub use mqtt::ConnectionState;

/// Broker session abstraction
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Into<AgentError> + Send + Sync + 'static;

    /// Open the session; returns once the broker has acknowledged it.
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Register the subscription's handler, subscribe, and wait for the
    /// broker to grant it. Granted subscriptions are replayed after every
    /// reconnect.
    async fn subscribe(&self, subscription: TopicSubscription) -> Result<(), Self::Error>;

    /// Publish a message; refused unless connected.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), Self::Error>;

    /// Close the session, flushing for at most `grace`.
    async fn disconnect(&self, grace: Duration) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    /// None until `connect` has been called
    fn connection_state(&self) -> Option<ConnectionState>;

    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    /// Watch channel of state changes, once connected
    fn state_watch(&self) -> Option<watch::Receiver<ConnectionState>>;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttSession;
