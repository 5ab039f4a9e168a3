//! Topic handlers for the three device subscriptions

use super::forwarder::SignalHandler;
use crate::error::AgentError;
use crate::protocol::{is_signal_command, payload_summary, DeviceTopics};
use crate::routing::{RoutingError, TopicFilter, TopicHandler, TopicSubscription};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, Instrument};

/// Logs every message it receives; used for config and state
pub struct LogHandler {
    name: String,
}

impl LogHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl TopicHandler for LogHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), AgentError> {
        info!(
            handler = %self.name,
            topic = %topic,
            size = payload.len(),
            payload = %payload_summary(payload),
            "Received message"
        );
        Ok(())
    }
}

/// Handles the commands sub-tree.
///
/// Every message is logged; only `.../commands/signal` reaches the signal
/// handler.
pub struct CommandsHandler<S: SignalHandler> {
    signal: S,
}

impl<S: SignalHandler> CommandsHandler<S> {
    pub fn new(signal: S) -> Self {
        Self { signal }
    }
}

#[async_trait]
impl<S: SignalHandler> TopicHandler for CommandsHandler<S> {
    fn name(&self) -> &str {
        "commands"
    }

    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), AgentError> {
        info!(
            topic = %topic,
            size = payload.len(),
            payload = %payload_summary(payload),
            "Received command"
        );

        if is_signal_command(topic) {
            let span = crate::command_span!(topic = %topic, size = payload.len());
            self.signal.on_signal(topic, payload).instrument(span).await
        } else {
            Ok(())
        }
    }
}

/// The three subscriptions every device makes, in subscription order:
/// config, state, then the commands wildcard.
pub fn device_subscriptions(
    topics: &DeviceTopics,
    commands: Arc<dyn TopicHandler>,
) -> Result<Vec<TopicSubscription>, RoutingError> {
    Ok(vec![
        TopicSubscription::new(
            TopicFilter::new(topics.config())?,
            Arc::new(LogHandler::new("config")),
        ),
        TopicSubscription::new(
            TopicFilter::new(topics.state())?,
            Arc::new(LogHandler::new("state")),
        ),
        TopicSubscription::new(TopicFilter::new(topics.commands_filter())?, commands),
    ])
}
