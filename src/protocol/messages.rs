//! Wire payloads exchanged with the broker
//!
//! State updates are bare UTF-8 strings; signal commands are small JSON
//! objects produced by the command relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Signal command carried on `/devices/{device}/commands/signal`
///
/// # Examples
/// ```
/// use cloud_iot_agent::protocol::CommandMessage;
///
/// let command = CommandMessage::parse(br#"{"remote":"r1","name":"open","duration":500}"#)?;
/// assert_eq!(command.remote, "r1");
/// assert_eq!(command.duration_millis, 500);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommandMessage {
    /// Remote controller the action is addressed to
    #[serde(default)]
    pub remote: String,
    /// Action name understood by the remote
    #[serde(default)]
    pub name: String,
    /// How long the action lasts, in milliseconds
    #[serde(rename = "duration", default)]
    pub duration_millis: i64,
}

impl CommandMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Lifecycle state reported on the device state topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Started,
    Stopped,
    HeartBeat,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Started => "started",
            DeviceState::Stopped => "stopped",
            DeviceState::HeartBeat => "heartBeat",
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        self.as_str().as_bytes().to_vec()
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short, log-safe rendering of an inbound payload
pub fn payload_summary(payload: &[u8]) -> String {
    const MAX_SUMMARY_CHARS: usize = 120;

    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > MAX_SUMMARY_CHARS {
        let head: String = text.chars().take(MAX_SUMMARY_CHARS).collect();
        format!("{head}...")
    } else {
        text.into_owned()
    }
}
