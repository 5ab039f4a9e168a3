//! Broker session and its supervisor
//!
//! `MqttSession` owns the shared `AsyncClient` handle and the state channel.
//! A supervisor task polls the `rumqttc` event loop, queues inbound messages
//! for the dispatcher task, and on connection loss mints a fresh token,
//! opens a new connection and replays the subscription registry.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, InboundMessage, MessageForwarder, MessageHandler};
use crate::auth::CredentialMinter;
use crate::config::MqttSection;
use crate::protocol::DeviceIdentity;
use crate::routing::{SubscriptionRegistry, TopicRouter, TopicSubscription};
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// Inbound messages waiting for the dispatcher; beyond this they are dropped
/// rather than stalling the event loop.
const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Running count of SUBACKs seen on this session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubAckTally {
    pub granted: u64,
    pub rejected: u64,
}

impl SubAckTally {
    pub fn total(&self) -> u64 {
        self.granted + self.rejected
    }
}

type SharedClient = Arc<Mutex<Option<AsyncClient>>>;

#[derive(Default)]
struct SessionTasks {
    supervisor: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

/// Authenticated, self-healing session with the device broker
pub struct MqttSession {
    identity: DeviceIdentity,
    config: MqttSection,
    minter: CredentialMinter,
    root_ca: Option<Vec<u8>>,
    reconnect_config: ReconnectConfig,
    router: Arc<TopicRouter>,
    registry: Arc<SubscriptionRegistry>,
    client: SharedClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    suback_tx: Arc<watch::Sender<SubAckTally>>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
    connect_started: bool,
    tasks: std::sync::Mutex<SessionTasks>,
}

impl MqttSession {
    pub fn new(
        identity: DeviceIdentity,
        config: MqttSection,
        minter: CredentialMinter,
        root_ca: Option<Vec<u8>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (suback_tx, _) = watch::channel(SubAckTally::default());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            identity,
            config,
            minter,
            root_ca,
            reconnect_config: ReconnectConfig::default(),
            router: Arc::new(TopicRouter::new()),
            registry: Arc::new(SubscriptionRegistry::new()),
            client: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
            suback_tx: Arc::new(suback_tx),
            shutdown_tx,
            closing: Arc::new(AtomicBool::new(false)),
            connect_started: false,
            tasks: std::sync::Mutex::new(SessionTasks::default()),
        }
    }

    pub fn with_reconnect_config(
        mut self,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        HealthMonitor::validate_connection_config(&reconnect_config)
            .map_err(MqttError::InvalidReconnectConfig)?;
        self.reconnect_config = reconnect_config;
        Ok(self)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn router(&self) -> Arc<TopicRouter> {
        self.router.clone()
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    /// Wait for the first CONNACK, or fail on the first terminal state
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(reason));
                    }
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }

                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectTimeout(timeout)),
        }
    }

    /// Wait until at least one SUBACK beyond `baseline` has been counted
    async fn wait_for_suback(
        mut suback_rx: watch::Receiver<SubAckTally>,
        baseline: SubAckTally,
        timeout: Duration,
    ) -> Result<SubAckTally, String> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let tally = *suback_rx.borrow_and_update();
                if tally.total() > baseline.total() {
                    return Ok(tally);
                }
                if suback_rx.changed().await.is_err() {
                    return Err("session closed while waiting for SUBACK".to_string());
                }
            }
        })
        .await;

        outcome.unwrap_or_else(|_| Err(format!("no SUBACK within {timeout:?}")))
    }

    async fn open_session(&mut self) -> Result<(), MqttError> {
        let (client, event_loop) = create_connection(
            &self.identity,
            &self.config,
            &self.minter,
            self.root_ca.as_deref(),
        )?;
        *self.client.lock().await = Some(client);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let dispatcher = spawn_dispatcher(self.router.clone(), inbound_rx);

        let supervisor = Supervisor {
            identity: self.identity.clone(),
            config: self.config.clone(),
            minter: self.minter.clone(),
            root_ca: self.root_ca.clone(),
            reconnect_config: self.reconnect_config.clone(),
            client: self.client.clone(),
            registry: self.registry.clone(),
            forwarder: MessageForwarder::new(inbound_tx),
            state_tx: self.state_tx.clone(),
            suback_tx: self.suback_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            closing: self.closing.clone(),
            ever_connected: false,
            reconnect_attempts: 0,
            replay_outstanding: 0,
        };
        let span = crate::session_span!(client_id = %self.identity.client_id());
        let supervisor = tokio::spawn(supervisor.run(event_loop).instrument(span));

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.supervisor = Some(supervisor);
        tasks.dispatcher = Some(dispatcher);
        Ok(())
    }

    fn abort_tasks(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = tasks.supervisor.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.dispatcher.take() {
            handle.abort();
        }
    }

    fn current_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Refuse an operation the current state does not allow
    fn check_connection_state(
        &self,
        allowed: fn(&ConnectionState) -> bool,
    ) -> Result<(), MqttError> {
        let state = if self.connect_started {
            self.current_state()
        } else {
            ConnectionState::Disconnected("Never connected".to_string())
        };

        if !allowed(&state) {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    async fn current_client(&self) -> Result<AsyncClient, MqttError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| MqttError::NotConnected {
                state: self.current_state(),
            })
    }
}

#[async_trait]
impl Transport for MqttSession {
    type Error = MqttError;

    /// A failure before the first CONNACK is returned here and nothing is
    /// retried; reconnects only happen once a session has been established.
    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.connect_started {
            return Err(MqttError::ConnectionFailed(
                "Session already started".to_string(),
            ));
        }
        self.connect_started = true;
        let _ = self.state_tx.send(ConnectionState::Connecting);

        info!(
            client_id = %self.identity.client_id(),
            broker = %self.config.broker_url,
            "Connecting to broker"
        );

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let result = match self.open_session().await {
            Ok(()) => Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!(error = %e, "Initial broker connection failed");
            self.abort_tasks();
            let _ = self.state_tx.send(ConnectionState::Disconnected(e.to_string()));
            return Err(e);
        }

        Ok(())
    }

    async fn subscribe(&self, subscription: TopicSubscription) -> Result<(), Self::Error> {
        self.check_connection_state(HealthMonitor::can_subscribe)?;

        let filter = subscription.filter.to_string();
        let failed = |reason: String| MqttError::SubscriptionFailed {
            filter: filter.clone(),
            reason,
        };

        // Routed before SUBSCRIBE goes out so retained messages are not lost.
        self.router
            .register(subscription.filter.clone(), subscription.handler.clone());

        let client = self.current_client().await?;
        let mut suback_rx = self.suback_tx.subscribe();
        let baseline = *suback_rx.borrow_and_update();

        client
            .subscribe(filter.clone(), subscription.qos)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let timeout = Duration::from_secs(self.config.publish_timeout_secs);
        let tally = Self::wait_for_suback(suback_rx, baseline, timeout)
            .await
            .map_err(&failed)?;

        if tally.rejected > baseline.rejected {
            return Err(failed("broker rejected the subscription".to_string()));
        }

        self.registry.record(subscription);
        info!(filter = %filter, "Subscription granted");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), Self::Error> {
        self.check_connection_state(HealthMonitor::can_publish)?;

        let client = self.current_client().await?;
        let size = payload.len();
        let timeout = Duration::from_secs(self.config.publish_timeout_secs);

        match tokio::time::timeout(timeout, client.publish(topic, qos, retain, payload)).await {
            Ok(Ok(())) => {
                debug!(topic = %topic, size, ?qos, retain, "Published message");
                Ok(())
            }
            Ok(Err(e)) => Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                reason: format!("timed out after {timeout:?}"),
            }),
        }
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), Self::Error> {
        self.closing.store(true, Ordering::SeqCst);

        let supervisor = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .supervisor
            .take();
        let Some(mut supervisor) = supervisor else {
            debug!("Disconnect requested on a session that is not running");
            return Ok(());
        };

        if let Some(client) = self.client.lock().await.clone() {
            if let Err(e) = client.try_disconnect() {
                warn!(error = %e, "Failed to queue DISCONNECT");
            }
        }

        match tokio::time::timeout(grace, &mut supervisor).await {
            Ok(_) => info!("Session supervisor stopped gracefully"),
            Err(_) => warn!(
                grace_ms = grace.as_millis() as u64,
                "Session supervisor did not stop within grace period, aborting"
            ),
        }

        self.abort_tasks();
        supervisor.abort();
        *self.client.lock().await = None;

        self.state_tx.send_modify(|state| {
            if !matches!(state, ConnectionState::PermanentlyDisconnected(_)) {
                *state = ConnectionState::Disconnected("Client disconnected".to_string());
            }
        });

        info!("Broker session closed");
        Ok(())
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        self.connect_started.then(|| self.current_state())
    }

    fn state_watch(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.connect_started.then(|| self.state_rx.clone())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Async disconnect is not possible here; callers should disconnect first.
        self.abort_tasks();
    }
}

/// Mint a fresh token and build a client/event loop pair
fn create_connection(
    identity: &DeviceIdentity,
    config: &MqttSection,
    minter: &CredentialMinter,
    root_ca: Option<&[u8]>,
) -> Result<(AsyncClient, EventLoop), MqttError> {
    let token = minter.mint_now()?;
    let options = configure_mqtt_options(identity, config, &token, root_ca)?;
    Ok(AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY))
}

/// Feed queued inbound messages to the router one at a time
fn spawn_dispatcher(
    router: Arc<TopicRouter>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound_rx.recv().await {
            let handled = router.dispatch(&message.topic, &message.payload).await;
            debug!(topic = %message.topic, handlers = handled, "Dispatched inbound message");
        }
        debug!("Inbound dispatcher stopped");
    })
}

/// Sleep for `delay_ms`, returning false if shutdown was requested meanwhile
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

enum Flow {
    Continue,
    Reconnect,
    Stop,
}

struct Supervisor {
    identity: DeviceIdentity,
    config: MqttSection,
    minter: CredentialMinter,
    root_ca: Option<Vec<u8>>,
    reconnect_config: ReconnectConfig,
    client: SharedClient,
    registry: Arc<SubscriptionRegistry>,
    forwarder: MessageForwarder,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    suback_tx: Arc<watch::Sender<SubAckTally>>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    ever_connected: bool,
    reconnect_attempts: u32,
    replay_outstanding: usize,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(client_id = %self.identity.client_id(), "Starting session supervisor");

        loop {
            let polled = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping session supervisor");
                        break;
                    }
                    continue;
                }
                polled = event_loop.poll() => polled,
            };

            let flow = match polled {
                Ok(event) => {
                    self.handle_route(MessageHandler::route_mqtt_event(&event))
                        .await
                }
                Err(e) => self.handle_connection_error(e.to_string()),
            };

            match flow {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::Reconnect => match self.reconnect().await {
                    Some(next) => event_loop = next,
                    None => break,
                },
            }
        }

        info!(client_id = %self.identity.client_id(), "Session supervisor stopped");
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.borrow().clone();
        HealthMonitor::log_state_transition(&previous, &next);
        let _ = self.state_tx.send(next);
    }

    async fn handle_route(&mut self, route: EventRoute) -> Flow {
        match route {
            EventRoute::ConnectionAcknowledged { accepted: true, .. } => {
                self.reconnect_attempts = 0;
                self.ever_connected = true;
                self.replay_subscriptions().await;

                // After a reconnect the session is only usable once every
                // replayed filter is granted again; record_suback announces it.
                if self.replay_outstanding == 0 {
                    self.transition(HealthMonitor::determine_next_state(
                        ConnectionEvent::ConnAckReceived,
                    ));
                }
                Flow::Continue
            }
            EventRoute::ConnectionAcknowledged {
                accepted: false,
                code,
            } => self.handle_connection_error(format!("Broker refused connection: {code}")),
            EventRoute::MessageReceived(message) => {
                // Drops are logged by the forwarder.
                let _ = self.forwarder.forward(message);
                Flow::Continue
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                self.record_suback(packet_id, granted)
            }
            EventRoute::Disconnected => {
                if self.closing.load(Ordering::SeqCst) {
                    return Flow::Stop;
                }
                self.transition(HealthMonitor::determine_next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
                if self.ever_connected {
                    Flow::Reconnect
                } else {
                    Flow::Stop
                }
            }
            EventRoute::DisconnectSent => {
                debug!("DISCONNECT sent, stopping event loop");
                Flow::Stop
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                Flow::Continue
            }
            EventRoute::OutgoingEvent => Flow::Continue,
        }
    }

    fn handle_connection_error(&mut self, reason: String) -> Flow {
        if self.closing.load(Ordering::SeqCst) {
            return Flow::Stop;
        }

        self.transition(HealthMonitor::determine_next_state(
            ConnectionEvent::NetworkError(reason),
        ));

        if self.ever_connected {
            Flow::Reconnect
        } else {
            Flow::Stop
        }
    }

    fn record_suback(&mut self, packet_id: u16, granted: bool) -> Flow {
        self.suback_tx.send_modify(|tally| {
            if granted {
                tally.granted += 1;
            } else {
                tally.rejected += 1;
            }
        });
        debug!(packet_id, granted, "SUBACK received");

        if self.replay_outstanding > 0 {
            self.replay_outstanding -= 1;
            if !granted {
                self.replay_outstanding = 0;
                let reason = format!("Broker rejected replayed subscription (packet {packet_id})");
                self.transition(HealthMonitor::determine_next_state(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                return Flow::Stop;
            }
            if self.replay_outstanding == 0 {
                self.transition(HealthMonitor::determine_next_state(
                    ConnectionEvent::ConnAckReceived,
                ));
            }
        }

        Flow::Continue
    }

    async fn replay_subscriptions(&mut self) {
        self.replay_outstanding = 0;
        let subscriptions = self.registry.snapshot();
        if subscriptions.is_empty() {
            return;
        }

        let Some(client) = self.client.lock().await.clone() else {
            return;
        };

        let mut sent = 0;
        for subscription in &subscriptions {
            match client.try_subscribe(subscription.filter.to_string(), subscription.qos) {
                Ok(()) => {
                    sent += 1;
                    debug!(filter = %subscription.filter, "Re-subscribed");
                }
                Err(e) => {
                    error!(filter = %subscription.filter, error = %e, "Failed to re-subscribe");
                }
            }
        }

        self.replay_outstanding = sent;
        info!(count = sent, "Replayed subscriptions after reconnect");
    }

    /// Back off, mint a fresh token and open a new connection.
    ///
    /// Returns the new event loop, or None when the supervisor should stop.
    async fn reconnect(&mut self) -> Option<EventLoop> {
        loop {
            let shutdown_requested =
                self.closing.load(Ordering::SeqCst) || *self.shutdown_rx.borrow();

            match HealthMonitor::should_attempt_reconnection(
                self.reconnect_attempts,
                &self.reconnect_config,
                shutdown_requested,
            ) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    self.reconnect_attempts = attempt;
                    self.transition(HealthMonitor::determine_next_state(
                        ConnectionEvent::ReconnectionStarted(attempt),
                    ));

                    let max_display = self
                        .reconnect_config
                        .max_attempts
                        .map_or("unlimited".to_string(), |max| max.to_string());
                    info!(attempt, max = %max_display, delay_ms, "Scheduling reconnection");

                    if !interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await
                        || self.closing.load(Ordering::SeqCst)
                    {
                        return None;
                    }

                    match create_connection(
                        &self.identity,
                        &self.config,
                        &self.minter,
                        self.root_ca.as_deref(),
                    ) {
                        Ok((client, event_loop)) => {
                            *self.client.lock().await = Some(client);
                            debug!(attempt, "Swapped in new broker connection");
                            return Some(event_loop);
                        }
                        Err(e) => {
                            error!(attempt, error = %e, "Failed to prepare reconnection");
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, abandoning reconnection");
                    return None;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!(
                        "Max reconnection attempts ({}) exceeded",
                        self.reconnect_attempts
                    );
                    self.transition(HealthMonitor::determine_next_state(
                        ConnectionEvent::PermanentFailure(reason),
                    ));
                    return None;
                }
            }
        }
    }
}
