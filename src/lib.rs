//! Cloud IoT device agent
//!
//! A long-lived connectivity agent for one remote device. It keeps an
//! authenticated MQTT session with a cloud IoT bridge, recovers from
//! connection loss by re-minting its credentials and replaying its
//! subscriptions, and forwards `signal` commands to a local HTTP endpoint.
//!
//! # Overview
//!
//! - [`auth`]: short-lived JWT credentials signed with the device key
//! - [`transport`]: the broker session and its reconnect supervisor
//! - [`routing`]: MQTT topic filters and the handler table
//! - [`agent`]: command forwarding, state publishing and the lifecycle
//! - [`relay`]: the cloud-side HTTP service that sends commands to devices
//!
//! # Quick Start
//!
//! ```rust
//! use cloud_iot_agent::protocol::{DeviceIdentity, DeviceTopics};
//!
//! let identity = DeviceIdentity::new("proj-a", "us-central1", "reg-1", "dev-1")?;
//! assert_eq!(
//!     identity.client_id(),
//!     "projects/proj-a/locations/us-central1/registries/reg-1/devices/dev-1"
//! );
//!
//! let topics = DeviceTopics::for_identity(&identity);
//! assert_eq!(topics.commands_filter(), "/devices/dev-1/commands/#");
//! # Ok::<(), cloud_iot_agent::protocol::IdentityError>(())
//! ```

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod relay;
pub mod routing;
pub mod testing;
pub mod transport;

pub use agent::AgentLifecycle;
pub use config::{AgentConfig, ConfigError, RelayConfig};
pub use error::{AgentError, AgentResult};
pub use protocol::*;
pub use transport::mqtt::MqttSession;
