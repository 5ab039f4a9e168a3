//! Device-scoped topic construction
//!
//! The broker exposes a fixed set of topics per device, all rooted at
//! `/devices/{device_id}`. Builders here are the only place the templates live.

use super::identity::DeviceIdentity;

/// Leaf that marks a command as a signal to forward to the action endpoint
pub const SIGNAL_COMMAND_SUFFIX: &str = "commands/signal";

/// Subfolder used by the registry API when sending signal commands
pub const SIGNAL_SUBFOLDER: &str = "signal";

/// Topic templates for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    root: String,
}

impl DeviceTopics {
    pub fn new(device_id: &str) -> Self {
        Self {
            root: format!("/devices/{device_id}"),
        }
    }

    pub fn for_identity(identity: &DeviceIdentity) -> Self {
        Self::new(&identity.device_id)
    }

    /// Broker-pushed configuration: `/devices/{device}/config`
    pub fn config(&self) -> String {
        format!("{}/config", self.root)
    }

    /// Device state, published and echoed: `/devices/{device}/state`
    pub fn state(&self) -> String {
        format!("{}/state", self.root)
    }

    /// Commands sub-tree root: `/devices/{device}/commands`
    pub fn commands_root(&self) -> String {
        format!("{}/commands", self.root)
    }

    /// Wildcard filter over every command subfolder: `/devices/{device}/commands/#`
    pub fn commands_filter(&self) -> String {
        format!("{}/#", self.commands_root())
    }

    /// Telemetry event: `/devices/{device}/events/{name}`
    pub fn event(&self, name: &str) -> String {
        format!("{}/events/{}", self.root, name.trim_matches('/'))
    }
}

/// Only the literal `commands/signal` leaf is forwarded.
pub fn is_signal_command(topic: &str) -> bool {
    topic.ends_with(SIGNAL_COMMAND_SUFFIX)
}
