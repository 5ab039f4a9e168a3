//! Forwarding of `signal` commands to the local action endpoint

use crate::config::ForwarderSection;
use crate::error::AgentError;
use crate::protocol::CommandMessage;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tracing::info;
use url::Url;

/// Receives the payload of every message on a `commands/signal` topic
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_signal(&self, topic: &str, payload: &[u8]) -> Result<(), AgentError>;
}

/// Posts each signal command to the configured endpoint, once, with no retry
#[derive(Debug, Clone)]
pub struct CommandForwarder {
    endpoint: Url,
    client: Client,
}

impl CommandForwarder {
    pub fn new(config: &ForwarderSection) -> Result<Self, AgentError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            AgentError::internal(format!("Invalid forwarder endpoint '{}': {e}", config.endpoint))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| AgentError::internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SignalHandler for CommandForwarder {
    /// The payload must decode as a command; it is then sent byte for byte.
    async fn on_signal(&self, topic: &str, payload: &[u8]) -> Result<(), AgentError> {
        let command = CommandMessage::parse(payload)
            .map_err(|e| AgentError::payload_decode(topic, e.to_string()))?;

        info!(
            remote = %command.remote,
            name = %command.name,
            duration_ms = command.duration_millis,
            endpoint = %self.endpoint,
            "Forwarding signal command"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| AgentError::forward(format!("POST {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            AgentError::forward(format!("Failed to read response from {}: {e}", self.endpoint))
        })?;

        if !status.is_success() {
            return Err(AgentError::forward(format!(
                "{} returned {status}: {body}",
                self.endpoint
            )));
        }

        info!(status = %status, response = %body, "Action endpoint acknowledged signal");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_endpoint() {
        let config = ForwarderSection {
            endpoint: "not a url".to_string(),
            request_timeout_ms: 1000,
        };
        assert!(matches!(
            CommandForwarder::new(&config),
            Err(AgentError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_decode_error() {
        let config = ForwarderSection {
            endpoint: "http://127.0.0.1:1/signal".to_string(),
            request_timeout_ms: 1000,
        };
        let forwarder = CommandForwarder::new(&config).unwrap();

        let result = forwarder
            .on_signal("/devices/dev-1/commands/signal", b"{not json")
            .await;
        assert!(matches!(result, Err(AgentError::PayloadDecode { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_forward_error() {
        let config = ForwarderSection {
            endpoint: "http://127.0.0.1:1/signal".to_string(),
            request_timeout_ms: 1000,
        };
        let forwarder = CommandForwarder::new(&config).unwrap();

        let result = forwarder
            .on_signal(
                "/devices/dev-1/commands/signal",
                br#"{"remote":"r1","name":"open","duration":500}"#,
            )
            .await;
        assert!(matches!(result, Err(AgentError::Forward { .. })));
    }
}
