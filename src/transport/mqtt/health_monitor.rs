//! Reconnection decisions and session state transitions
//!
//! Pure functions only; the supervisor feeds them events and acts on the
//! returned decisions.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let backoff_delay = config.calculate_backoff_delay(current_attempts + 1);
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: backoff_delay,
        }
    }

    /// Determine next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker session established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "Broker connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting reconnection attempt");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt, "Reconnection successful");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "Broker session permanently failed");
            }
            _ => {
                info!("Broker session state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnect configuration
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 250
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);

        let decision = HealthMonitor::should_attempt_reconnection(2, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 1000
            }
        );

        // Unlimited by default, sustained after the pattern
        let decision = HealthMonitor::should_attempt_reconnection(500, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 501,
                delay_ms: 5000
            }
        );

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..ReconnectConfig::default()
        };
        let decision = HealthMonitor::should_attempt_reconnection(5, &limited, false);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                "timeout".to_string()
            )),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(3)),
            ConnectionState::Reconnecting(3)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                "suback rejected".to_string()
            )),
            ConnectionState::PermanentlyDisconnected("suback rejected".to_string())
        );
    }

    #[test]
    fn test_operations_only_when_connected() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(HealthMonitor::can_subscribe(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_subscribe(&ConnectionState::Reconnecting(2)));
        assert!(!HealthMonitor::can_subscribe(
            &ConnectionState::PermanentlyDisconnected("x".to_string())
        ));
    }

    #[test]
    fn test_validate_connection_config() {
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig::default()).is_ok());

        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..ReconnectConfig::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_attempts).is_err());

        let zero_delay = ReconnectConfig {
            sustained_delay: 0,
            ..ReconnectConfig::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_delay).is_err());
    }
}
