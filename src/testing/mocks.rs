//! Mock implementations for testing
//!
//! Provides a mock Transport, a counting signal handler and a mock registry
//! command sender so the agent and relay can be exercised without a broker
//! or an HTTP endpoint.

use crate::agent::SignalHandler;
use crate::error::AgentError;
use crate::protocol::CommandMessage;
use crate::relay::{CommandSender, RelayError};
use crate::routing::{SubscriptionRegistry, TopicRouter, TopicSubscription};
use crate::transport::{ConnectionState, Transport};
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// A message captured by [`MockTransport::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct MockState {
    published: Mutex<Vec<PublishedMessage>>,
    active: Mutex<Vec<String>>,
    router: Arc<TopicRouter>,
    registry: SubscriptionRegistry,
    state_tx: watch::Sender<ConnectionState>,
    connected_once: AtomicBool,
    connect_should_fail: AtomicBool,
    subscribe_should_fail: AtomicBool,
    publish_should_fail: AtomicBool,
    disconnects: AtomicUsize,
    losses: AtomicUsize,
}

/// In-memory transport. Clones share state, so a test can keep a handle
/// while the lifecycle owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(MockState {
                published: Mutex::new(Vec::new()),
                active: Mutex::new(Vec::new()),
                router: Arc::new(TopicRouter::new()),
                registry: SubscriptionRegistry::new(),
                state_tx,
                connected_once: AtomicBool::new(false),
                connect_should_fail: AtomicBool::new(false),
                subscribe_should_fail: AtomicBool::new(false),
                publish_should_fail: AtomicBool::new(false),
                disconnects: AtomicUsize::new(0),
                losses: AtomicUsize::new(0),
            }),
        }
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("state", &*self.inner.state_tx.borrow())
            .field("active", &*lock(&self.inner.active))
            .field("published", &lock(&self.inner.published).len())
            .finish()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connect_should_fail(&self, fail: bool) {
        self.inner.connect_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_subscribe_should_fail(&self, fail: bool) {
        self.inner.subscribe_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_publish_should_fail(&self, fail: bool) {
        self.inner.publish_should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        lock(&self.inner.published).clone()
    }

    /// Payloads published to `topic`, in order
    pub fn payloads_on(&self, topic: &str) -> Vec<Vec<u8>> {
        lock(&self.inner.published)
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn clear_published(&self) {
        lock(&self.inner.published).clear();
    }

    /// Filters currently subscribed on the simulated broker, in order
    pub fn active_subscriptions(&self) -> Vec<String> {
        lock(&self.inner.active).clone()
    }

    pub fn router(&self) -> Arc<TopicRouter> {
        self.inner.router.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn loss_count(&self) -> usize {
        self.inner.losses.load(Ordering::SeqCst)
    }

    /// Deliver an inbound message as if the broker had sent it.
    /// Returns the number of handlers invoked.
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        self.inner.router.dispatch(topic, payload).await
    }

    /// Drop the session and bring it back: broker-side subscriptions are
    /// lost, then the registry is replayed in order.
    pub fn simulate_connection_loss(&self) {
        let attempt = self.inner.losses.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        self.inner
            .state_tx
            .send_replace(ConnectionState::Reconnecting(attempt));

        let mut active = lock(&self.inner.active);
        active.clear();
        active.extend(self.inner.registry.filters());
        drop(active);

        self.inner.state_tx.send_replace(ConnectionState::Connected);
    }

    pub fn simulate_permanent_failure(&self, reason: &str) {
        self.inner
            .state_tx
            .send_replace(ConnectionState::PermanentlyDisconnected(reason.to_string()));
    }

    /// Poll until at least `count` messages with `payload` were published.
    pub async fn wait_for_payload_count(&self, payload: &[u8], count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let seen = lock(&self.inner.published)
                .iter()
                .filter(|m| m.payload == payload)
                .count();
            if seen >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn current_state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = AgentError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.inner.connected_once.store(true, Ordering::SeqCst);

        if self.inner.connect_should_fail.load(Ordering::SeqCst) {
            self.inner
                .state_tx
                .send_replace(ConnectionState::Disconnected("mock connect failure".into()));
            return Err(AgentError::connect("Mock connect failure"));
        }

        self.inner.state_tx.send_replace(ConnectionState::Connected);
        Ok(())
    }

    async fn subscribe(&self, subscription: TopicSubscription) -> Result<(), Self::Error> {
        let filter = subscription.filter.to_string();

        if self.current_state() != ConnectionState::Connected {
            return Err(AgentError::subscribe(&filter, "Not connected"));
        }
        if self.inner.subscribe_should_fail.load(Ordering::SeqCst) {
            return Err(AgentError::subscribe(&filter, "Mock subscription rejected"));
        }

        self.inner
            .router
            .register(subscription.filter.clone(), subscription.handler.clone());

        {
            let mut active = lock(&self.inner.active);
            if !active.contains(&filter) {
                active.push(filter);
            }
        }
        self.inner.registry.record(subscription);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), Self::Error> {
        if self.inner.publish_should_fail.load(Ordering::SeqCst) {
            return Err(AgentError::publish(topic, "Mock publish failure"));
        }
        if self.current_state() != ConnectionState::Connected {
            return Err(AgentError::publish(topic, "Not connected"));
        }

        lock(&self.inner.published).push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) -> Result<(), Self::Error> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.active).clear();
        if !matches!(
            self.current_state(),
            ConnectionState::PermanentlyDisconnected(_)
        ) {
            self.inner
                .state_tx
                .send_replace(ConnectionState::Disconnected("client shutdown".into()));
        }
        Ok(())
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        self.inner
            .connected_once
            .load(Ordering::SeqCst)
            .then(|| self.current_state())
    }

    fn state_watch(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.inner
            .connected_once
            .load(Ordering::SeqCst)
            .then(|| self.inner.state_tx.subscribe())
    }
}

/// Records every signal payload it receives
#[derive(Debug, Clone, Default)]
pub struct CountingSignalHandler {
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CountingSignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        lock(&self.payloads).len()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.payloads).clone()
    }
}

#[async_trait]
impl SignalHandler for CountingSignalHandler {
    async fn on_signal(&self, _topic: &str, payload: &[u8]) -> Result<(), AgentError> {
        lock(&self.payloads).push(payload.to_vec());
        Ok(())
    }
}

/// A registry command call captured by [`MockCommandSender`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub device_id: String,
    pub command: CommandMessage,
}

/// Records send-command calls instead of calling the registry API
#[derive(Debug, Clone, Default)]
pub struct MockCommandSender {
    sent: Arc<Mutex<Vec<SentCommand>>>,
    failure: Option<String>,
}

impl MockCommandSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl CommandSender for MockCommandSender {
    async fn send_command(&self, device_id: &str, command: &CommandMessage) -> Result<(), RelayError> {
        lock(&self.sent).push(SentCommand {
            device_id: device_id.to_string(),
            command: command.clone(),
        });

        match &self.failure {
            Some(message) => Err(RelayError::Upstream {
                status: 503,
                body: message.clone(),
            }),
            None => Ok(()),
        }
    }
}
