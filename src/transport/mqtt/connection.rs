//! Connection state, reconnect policy and broker options
//!
//! Everything here is pure: building `MqttOptions` from configuration and a
//! freshly minted token, and computing backoff delays. The supervisor in
//! [`super::client`] owns the I/O.

use crate::auth::{AuthToken, CredentialError};
use crate::config::{parse_broker_url, ConfigError, MqttSection};
use crate::error::AgentError;
use crate::protocol::DeviceIdentity;
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// The broker ignores the username; the token is carried in the password.
pub const BROKER_USERNAME: &str = "unused";

/// Largest inbound packet accepted, matching the broker's payload limit
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection state for the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason; terminal after a failed startup or shutdown
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - retries exhausted or subscriptions rejected
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2500],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Broker session errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Credential minting failed: {0}")]
    Credential(#[from] CredentialError),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timed out after {0:?} waiting for CONNACK")]
    ConnectTimeout(Duration),
    #[error("Publishing to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscription to '{filter}' failed: {reason}")]
    SubscriptionFailed { filter: String, reason: String },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid root CA bundle '{path}': {reason}")]
    InvalidRootCa { path: String, reason: String },
    #[error("Invalid reconnect policy: {0}")]
    InvalidReconnectConfig(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

impl From<MqttError> for AgentError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::Credential(e) => e.into(),
            MqttError::SubscriptionFailed { filter, reason } => AgentError::subscribe(filter, reason),
            MqttError::PublishFailed { topic, reason } => AgentError::publish(topic, reason),
            e @ (MqttError::InvalidBrokerUrl(_)
            | MqttError::InvalidRootCa { .. }
            | MqttError::InvalidReconnectConfig(_)) => {
                AgentError::Config(ConfigError::InvalidConfig(e.to_string()))
            }
            e @ (MqttError::ConnectionFailed(_)
            | MqttError::ConnectTimeout(_)
            | MqttError::NotConnected { .. }) => AgentError::connect(e.to_string()),
        }
    }
}

/// Build broker options for one connection attempt.
///
/// `root_ca` is the PEM bundle returned by [`load_root_ca`]; `None` uses
/// the platform trust store.
pub fn configure_mqtt_options(
    identity: &DeviceIdentity,
    config: &MqttSection,
    token: &AuthToken,
    root_ca: Option<&[u8]>,
) -> Result<MqttOptions, MqttError> {
    let endpoint = parse_broker_url(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let mut mqtt_options = MqttOptions::new(identity.client_id(), endpoint.host, endpoint.port);

    if endpoint.tls {
        let transport = match root_ca {
            Some(ca) => RumqttcTransport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.to_vec(),
                alpn: None,
                client_auth: None,
            }),
            None => RumqttcTransport::tls_with_default_config(),
        };
        mqtt_options.set_transport(transport);
    }

    mqtt_options.set_credentials(BROKER_USERNAME, token.token.clone());
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    Ok(mqtt_options)
}

/// Load the optional root CA bundle.
///
/// A missing file falls back to the platform trust store with a warning; a
/// file without any PEM certificate is a configuration error.
pub fn load_root_ca(path: Option<&Path>) -> Result<Option<Vec<u8>>, MqttError> {
    let Some(path) = path else {
        return Ok(None);
    };

    let bundle = match std::fs::read(path) {
        Ok(bundle) => bundle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                path = %path.display(),
                "Root CA bundle not found, using platform trust store"
            );
            return Ok(None);
        }
        Err(e) => {
            return Err(MqttError::InvalidRootCa {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };

    if !String::from_utf8_lossy(&bundle).contains("-----BEGIN CERTIFICATE-----") {
        return Err(MqttError::InvalidRootCa {
            path: path.display().to_string(),
            reason: "no PEM certificate found".to_string(),
        });
    }

    info!(path = %path.display(), "Pinned broker root CA bundle");
    Ok(Some(bundle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("proj-a", "us-central1", "reg-1", "dev-1").unwrap()
    }

    fn token() -> AuthToken {
        let now = Utc::now();
        AuthToken {
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            audience: "proj-a".to_string(),
            token: "header.claims.signature".to_string(),
        }
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![250, 500, 1000, 2500]);
        assert_eq!(config.sustained_delay, 5000);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), 250);
        assert_eq!(config.calculate_backoff_delay(2), 500);
        assert_eq!(config.calculate_backoff_delay(4), 2500);
        assert_eq!(config.calculate_backoff_delay(5), 5000);
        assert_eq!(config.calculate_backoff_delay(100), 5000);

        let empty = ReconnectConfig {
            backoff_pattern: vec![],
            ..ReconnectConfig::default()
        };
        assert_eq!(empty.calculate_backoff_delay(1), 5000);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = MqttSection::with_broker("mqtts://mqtt.example.com:8883");
        let options = configure_mqtt_options(&identity(), &config, &token(), None).unwrap();

        assert_eq!(
            options.client_id(),
            "projects/proj-a/locations/us-central1/registries/reg-1/devices/dev-1"
        );
        assert_eq!(
            options.broker_address(),
            ("mqtt.example.com".to_string(), 8883)
        );
        assert_eq!(
            options.credentials(),
            Some((
                BROKER_USERNAME.to_string(),
                "header.claims.signature".to_string()
            ))
        );
        assert!(options.clean_session());
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_broker_url() {
        let config = MqttSection::with_broker("invalid-url");
        let result = configure_mqtt_options(&identity(), &config, &token(), None);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_missing_root_ca_falls_back() {
        let result = load_root_ca(Some(Path::new("/nonexistent/roots.pem"))).unwrap();
        assert!(result.is_none());
        assert!(load_root_ca(None).unwrap().is_none());
    }

    #[test]
    fn test_root_ca_without_certificate_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate").unwrap();

        let result = load_root_ca(Some(file.path()));
        assert!(matches!(result, Err(MqttError::InvalidRootCa { .. })));
    }

    #[test]
    fn test_root_ca_fixture_loads() {
        let bundle = load_root_ca(Some(Path::new("tests/fixtures/roots.pem")))
            .unwrap()
            .unwrap();
        assert!(!bundle.is_empty());
    }

    #[test]
    fn test_errors_map_onto_agent_taxonomy() {
        let connect = AgentError::from(MqttError::ConnectTimeout(Duration::from_secs(30)));
        assert!(matches!(connect, AgentError::Connect { .. }));
        assert!(connect.is_fatal_at_startup());

        let subscribe = AgentError::from(MqttError::SubscriptionFailed {
            filter: "/devices/dev-1/config".to_string(),
            reason: "rejected".to_string(),
        });
        assert!(matches!(subscribe, AgentError::Subscribe { ref topic, .. } if topic == "/devices/dev-1/config"));

        let publish = AgentError::from(MqttError::PublishFailed {
            topic: "/devices/dev-1/state".to_string(),
            reason: "timed out".to_string(),
        });
        assert!(!publish.is_fatal_at_startup());

        let root_ca = AgentError::from(MqttError::InvalidRootCa {
            path: "roots.pem".to_string(),
            reason: "no PEM certificate found".to_string(),
        });
        assert!(matches!(root_ca, AgentError::Config(_)));
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Disconnected("test".to_string())
        );
    }
}
