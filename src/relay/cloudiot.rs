//! Device registry command API client

use crate::config::{ConfigError, RelayConfig};
use crate::protocol::{
    validate_identity_segment, CommandMessage, IdentityError, RegistryPath, SIGNAL_SUBFOLDER,
};
use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Delivers one command to one device
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_command(&self, device_id: &str, command: &CommandMessage) -> Result<(), RelayError>;
}

/// Body of a `sendCommandToDevice` call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandRequest {
    /// Base64 of the JSON-encoded command
    pub binary_data: String,
    pub subfolder: String,
}

impl SendCommandRequest {
    /// Encodes under the `signal` subfolder, so the device receives it on
    /// `/devices/{device}/commands/signal`.
    pub fn for_command(command: &CommandMessage) -> Result<Self, RelayError> {
        Ok(Self {
            binary_data: BASE64_STANDARD.encode(command.to_json_bytes()?),
            subfolder: SIGNAL_SUBFOLDER.to_string(),
        })
    }

    /// Inverse of [`SendCommandRequest::for_command`]
    pub fn decode_command(&self) -> Result<CommandMessage, RelayError> {
        let bytes = BASE64_STANDARD
            .decode(&self.binary_data)
            .map_err(|e| RelayError::InvalidRequest(format!("binaryData is not base64: {e}")))?;
        Ok(CommandMessage::parse(&bytes)?)
    }
}

/// Calls the registry API over HTTPS with a bearer token
#[derive(Clone)]
pub struct CloudIotCommandSender {
    client: Client,
    api_base_url: Url,
    registry: RegistryPath,
    access_token: String,
}

impl std::fmt::Debug for CloudIotCommandSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudIotCommandSender")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("registry", &self.registry)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

impl CloudIotCommandSender {
    pub fn new(config: &RelayConfig, access_token: impl Into<String>) -> Result<Self, RelayError> {
        let registry = config.registry.path()?;
        let api_base_url = Url::parse(&config.relay.api_base_url).map_err(|e| {
            RelayError::Config(ConfigError::InvalidConfig(format!(
                "api_base_url '{}' is not a valid URL: {e}",
                config.relay.api_base_url
            )))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.relay.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            api_base_url,
            registry,
            access_token: access_token.into(),
        })
    }

    /// Build from config, reading the token from the configured variable
    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        let token = config.access_token()?;
        Self::new(config, token)
    }

    /// `{base}/v1/projects/{p}/locations/{r}/registries/{g}/devices/{d}:sendCommandToDevice`
    pub fn command_url(&self, device_id: &str) -> String {
        format!(
            "{}/v1/{}:sendCommandToDevice",
            self.api_base_url.as_str().trim_end_matches('/'),
            self.registry.device_name(device_id)
        )
    }
}

#[async_trait]
impl CommandSender for CloudIotCommandSender {
    async fn send_command(&self, device_id: &str, command: &CommandMessage) -> Result<(), RelayError> {
        validate_identity_segment("device_id", device_id)?;

        let url = self.command_url(device_id);
        let body = SendCommandRequest::for_command(command)?;
        debug!(url = %url, subfolder = %body.subfolder, "Sending command to device");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            device_id = %device_id,
            remote = %command.remote,
            name = %command.name,
            "Command delivered to registry"
        );
        Ok(())
    }
}

/// Command relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid command JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid device id: {0}")]
    InvalidDevice(#[from] IdentityError),
    #[error("Registry API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Registry API returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegistrySection, RelaySection};

    fn relay_config(base: &str) -> RelayConfig {
        RelayConfig {
            registry: RegistrySection {
                project_id: "proj-a".into(),
                region: "us-central1".into(),
                registry_id: "reg-1".into(),
            },
            relay: RelaySection {
                api_base_url: base.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_send_command_request_encoding() {
        let command = CommandMessage {
            remote: "r1".into(),
            name: "open".into(),
            duration_millis: 500,
        };
        let request = SendCommandRequest::for_command(&command).unwrap();

        assert_eq!(request.subfolder, "signal");
        let decoded = BASE64_STANDARD.decode(&request.binary_data).unwrap();
        assert_eq!(decoded, br#"{"remote":"r1","name":"open","duration":500}"#);
        assert_eq!(request.decode_command().unwrap(), command);

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("binaryData").is_some());
        assert!(json.get("binary_data").is_none());
    }

    #[test]
    fn test_command_url() {
        let sender = CloudIotCommandSender::new(&relay_config("https://api.example.com/"), "t").unwrap();
        assert_eq!(
            sender.command_url("dev-1"),
            "https://api.example.com/v1/projects/proj-a/locations/us-central1/registries/reg-1/devices/dev-1:sendCommandToDevice"
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let sender =
            CloudIotCommandSender::new(&relay_config("https://api.example.com"), "secret-token").unwrap();
        assert!(!format!("{sender:?}").contains("secret-token"));
    }

    #[tokio::test]
    async fn test_invalid_device_id_rejected_before_request() {
        let sender = CloudIotCommandSender::new(&relay_config("http://127.0.0.1:1"), "t").unwrap();
        let result = sender
            .send_command("dev/1", &CommandMessage::default())
            .await;
        assert!(matches!(result, Err(RelayError::InvalidDevice(_))));
    }
}
