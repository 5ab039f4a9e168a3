//! Device state publishing and the heartbeat ticker

use crate::error::AgentError;
use crate::protocol::{DeviceState, DeviceTopics};
use crate::transport::Transport;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Publishes lifecycle states and named events for one device
pub struct StatePublisher<T: Transport> {
    transport: Arc<T>,
    topics: DeviceTopics,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<T: Transport> StatePublisher<T> {
    pub fn new(transport: Arc<T>, topics: DeviceTopics) -> Self {
        Self {
            transport,
            topics,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// QoS 1, not retained, to the device state topic
    pub async fn publish_state(&self, state: DeviceState) -> Result<(), AgentError> {
        let topic = self.topics.state();
        self.transport
            .publish(&topic, QoS::AtLeastOnce, false, state.payload())
            .await
            .map_err(|e| AgentError::publish(&topic, e.to_string()))?;

        debug!(topic = %topic, state = %state, "Published device state");
        Ok(())
    }

    pub async fn publish_started(&self) -> Result<(), AgentError> {
        self.publish_state(DeviceState::Started).await?;
        self.started.store(true, Ordering::SeqCst);
        info!("Published started state");
        Ok(())
    }

    /// Publishes "stopped" at most once, and only after a successful
    /// "started". Returns whether a publish was attempted.
    pub async fn publish_stopped(&self) -> Result<bool, AgentError> {
        if !self.started.load(Ordering::SeqCst) {
            debug!("Skipping stopped state: started was never published");
            return Ok(false);
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        self.publish_state(DeviceState::Stopped).await?;
        info!("Published stopped state");
        Ok(true)
    }

    /// QoS 1 to `/devices/{device}/events/{name}`
    pub async fn publish_event(&self, name: &str, payload: Vec<u8>) -> Result<(), AgentError> {
        let topic = self.topics.event(name);
        self.transport
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| AgentError::publish(&topic, e.to_string()))?;

        debug!(topic = %topic, "Published device event");
        Ok(())
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Periodic "heartBeat" publisher
pub struct HeartbeatTicker {
    handle: JoinHandle<()>,
    cancelled: AtomicBool,
}

impl HeartbeatTicker {
    /// First beat one `period` after spawning, then every `period`. Missed
    /// ticks are skipped and failed publishes are not retried.
    pub fn spawn<T: Transport + 'static>(publisher: Arc<StatePublisher<T>>, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                match publisher.publish_state(DeviceState::HeartBeat).await {
                    Ok(()) => debug!(period_secs = period.as_secs(), "Heartbeat published"),
                    Err(e) => error!(error = %e, "Heartbeat publish failed"),
                }
            }
        });

        info!(period_secs = period.as_secs(), "Heartbeat started");
        Self {
            handle,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Stop the ticker. Returns true only on the first call.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.handle.abort();
        info!("Heartbeat stopped");
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;

    async fn connected_publisher() -> (MockTransport, Arc<StatePublisher<MockTransport>>) {
        let mut transport = MockTransport::new();
        transport.connect().await.unwrap();
        let publisher = Arc::new(StatePublisher::new(
            Arc::new(transport.clone()),
            DeviceTopics::new("dev-1"),
        ));
        (transport, publisher)
    }

    #[tokio::test]
    async fn test_publish_state_topic_and_payload() {
        let (transport, publisher) = connected_publisher().await;
        publisher.publish_started().await.unwrap();

        let published = transport.published_messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "/devices/dev-1/state");
        assert_eq!(published[0].payload, b"started");
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        assert!(!published[0].retain);
    }

    #[tokio::test]
    async fn test_stopped_requires_started() {
        let (transport, publisher) = connected_publisher().await;

        assert!(!publisher.publish_stopped().await.unwrap());
        assert!(transport.published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_at_most_once() {
        let (transport, publisher) = connected_publisher().await;
        publisher.publish_started().await.unwrap();

        assert!(publisher.publish_stopped().await.unwrap());
        assert!(!publisher.publish_stopped().await.unwrap());

        let stopped = transport
            .published_messages()
            .iter()
            .filter(|m| m.payload == b"stopped")
            .count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn test_failed_started_is_not_recorded() {
        let (transport, publisher) = connected_publisher().await;
        transport.set_publish_should_fail(true);

        assert!(publisher.publish_started().await.is_err());
        assert!(!publisher.has_started());

        transport.set_publish_should_fail(false);
        assert!(!publisher.publish_stopped().await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_event_topic() {
        let (transport, publisher) = connected_publisher().await;
        publisher
            .publish_event("button", b"on".to_vec())
            .await
            .unwrap();

        let published = transport.published_messages();
        assert_eq!(published[0].topic, "/devices/dev-1/events/button");
        assert_eq!(published[0].payload, b"on");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cancel_once() {
        let (_transport, publisher) = connected_publisher().await;
        let ticker = HeartbeatTicker::spawn(publisher, Duration::from_secs(60));

        assert!(ticker.cancel());
        assert!(!ticker.cancel());
        assert!(ticker.is_cancelled());
    }
}
