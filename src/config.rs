//! Agent and relay configuration
//!
//! Configuration is read once from a TOML file, overlaid with the legacy
//! environment variables the device images already export, validated, and
//! then passed by value into every constructor. Nothing reads the
//! environment again after loading, except secret lookups that happen at
//! the point of use.

use crate::protocol::{DeviceIdentity, IdentityError, RegistryPath};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Broker-imposed ceiling on device token lifetime
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

/// Device agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub registry: RegistrySection,
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    pub auth: AuthSection,
    pub forwarder: ForwarderSection,
}

/// Project, region and registry the device is enrolled in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySection {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier inside the registry
    pub id: String,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL; `mqtts://`, `ssl://` and `tls://` select TLS
    pub broker_url: String,
    /// Optional PEM bundle to pin the broker's root CA
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    /// Heartbeat state publish interval in seconds (default: 60)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_ms: u64,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_disconnect_grace() -> u64 {
    250
}

impl MqttSection {
    /// Section with defaults for everything but the broker URL
    pub fn with_broker(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            root_ca_path: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            publish_timeout_secs: default_publish_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            disconnect_grace_ms: default_disconnect_grace(),
        }
    }
}

/// Signing algorithm for device tokens
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SigningAlgorithm {
    #[default]
    RS256,
    ES256,
}

/// Device credential section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// PEM private key registered with the device
    pub private_key_path: PathBuf,
    /// Matching certificate; informational, the broker holds the public half
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub algorithm: SigningAlgorithm,
    /// Token lifetime in seconds (default: 3600, max: 86400)
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
}

fn default_token_lifetime() -> u64 {
    60 * 60
}

/// Action endpoint that receives forwarded signal commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwarderSection {
    pub endpoint: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 {
    10_000
}

/// Command relay configuration (cloud side)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub registry: RegistrySection,
    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL of the device registry API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Environment variable holding the registry API bearer token
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_base_url: default_api_base_url(),
            access_token_env: default_access_token_env(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_api_base_url() -> String {
    "https://cloudiot.googleapis.com".to_string()
}

fn default_access_token_env() -> String {
    "CLOUDIOT_ACCESS_TOKEN".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from TOML file with environment variable overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AgentConfig = toml::from_str(&content)?;

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    /// Overlay the variables the original device images export.
    ///
    /// `lookup` is injected so tests never touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.registry.apply_env_overrides(&lookup);
        if let Some(broker) = lookup("BROKER") {
            self.mqtt.broker_url = broker;
        }
        if let Some(device_id) = lookup("DEVICE_ID") {
            self.device.id = device_id;
        }
        if let Some(endpoint) = lookup("ENDPOINT") {
            self.forwarder.endpoint = endpoint;
        }
    }

    /// Check every invariant the runtime relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;

        parse_broker_url(&self.mqtt.broker_url)?;

        let endpoint = Url::parse(&self.forwarder.endpoint).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "forwarder endpoint '{}' is not a valid URL: {e}",
                self.forwarder.endpoint
            ))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "forwarder endpoint must be http or https, got '{}'",
                endpoint.scheme()
            )));
        }

        if self.auth.token_lifetime_secs == 0
            || self.auth.token_lifetime_secs > MAX_TOKEN_LIFETIME_SECS
        {
            return Err(ConfigError::InvalidConfig(format!(
                "token_lifetime_secs must be between 1 and {MAX_TOKEN_LIFETIME_SECS}, got {}",
                self.auth.token_lifetime_secs
            )));
        }

        if self.mqtt.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.connect_timeout_secs == 0 || self.mqtt.publish_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect and publish timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validated device identity
    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let registry = self.registry.path()?;
        Ok(DeviceIdentity::in_registry(&registry, self.device.id.clone())?)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[registry]
project_id = "proj-a"
region = "us-central1"
registry_id = "reg-1"

[device]
id = "dev-1"

[mqtt]
broker_url = "mqtts://mqtt.example.com:8883"

[auth]
private_key_path = "tests/fixtures/rsa_private.pem"

[forwarder]
endpoint = "http://localhost:8000/signal"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl RegistrySection {
    fn apply_env_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(project_id) = lookup("PROJECT_ID") {
            self.project_id = project_id;
        }
        if let Some(region) = lookup("CLOUD_REGION") {
            self.region = region;
        }
        // REGISTORY_ID is the historical spelling still set on older images
        if let Some(registry_id) = lookup("REGISTRY_ID").or_else(|| lookup("REGISTORY_ID")) {
            self.registry_id = registry_id;
        }
    }

    pub fn path(&self) -> Result<RegistryPath, ConfigError> {
        Ok(RegistryPath::new(
            self.project_id.clone(),
            self.region.clone(),
            self.registry_id.clone(),
        )?)
    }
}

impl RelayConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RelayConfig = toml::from_str(&content)?;

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.registry.apply_env_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.path()?;
        Url::parse(&self.relay.api_base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "api_base_url '{}' is not a valid URL: {e}",
                self.relay.api_base_url
            ))
        })?;
        self.relay
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                ConfigError::InvalidConfig(format!(
                    "listen_addr '{}' is not a socket address: {e}",
                    self.relay.listen_addr
                ))
            })?;
        Ok(())
    }

    /// Registry API bearer token, resolved at the point of use
    pub fn access_token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.relay.access_token_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.relay.access_token_env.clone()))
    }
}

/// Broker endpoint extracted from a configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse a broker URL into host, port and TLS flag
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, ConfigError> {
    let invalid = || ConfigError::InvalidConfig(format!("Invalid broker URL: {broker_url}"));

    let url = Url::parse(broker_url).map_err(|_| invalid())?;
    let tls = match url.scheme() {
        "mqtts" | "ssl" | "tls" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(invalid()),
    };
    let host = url.host_str().ok_or_else(invalid)?.to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint { host, port, tls })
}
