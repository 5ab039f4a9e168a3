//! Agent lifecycle orchestration
//!
//! `Init -> Connecting -> Running -> Draining -> Terminated`. Startup is
//! connect, the three device subscriptions, "started", then heartbeat.
//! Shutdown is the reverse and may be called from any phase.

use super::handlers::device_subscriptions;
use super::state::{HeartbeatTicker, StatePublisher};
use crate::config::{AgentConfig, ConfigError};
use crate::error::AgentError;
use crate::protocol::DeviceTopics;
use crate::routing::{RoutingError, TopicHandler};
use crate::transport::{ConnectionState, Transport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Why a running agent stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Process signal, e.g. SIGINT or SIGTERM
    Signal(&'static str),
    /// Signal handlers could not be installed
    SignalSetup(String),
    /// The broker session gave up reconnecting
    SessionLost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    Connecting,
    Running,
    Draining,
    Terminated,
}

/// Agent lifecycle management with an injected transport
pub struct AgentLifecycle<T>
where
    T: Transport + 'static,
{
    config: AgentConfig,
    topics: DeviceTopics,
    commands: Arc<dyn TopicHandler>,
    pending_transport: Option<T>,
    transport: Option<Arc<T>>,
    publisher: Option<Arc<StatePublisher<T>>>,
    heartbeat: Option<HeartbeatTicker>,
    reconnect_watcher: Option<JoinHandle<()>>,
    phase: LifecyclePhase,
}

impl<T> AgentLifecycle<T>
where
    T: Transport + 'static,
{
    /// `commands` handles the commands sub-tree; in production it wraps the
    /// command forwarder.
    pub fn new(
        config: AgentConfig,
        transport: T,
        commands: Arc<dyn TopicHandler>,
    ) -> Result<Self, LifecycleError> {
        let identity = config.identity()?;

        Ok(Self {
            topics: DeviceTopics::for_identity(&identity),
            config,
            commands,
            pending_transport: Some(transport),
            transport: None,
            publisher: None,
            heartbeat: None,
            reconnect_watcher: None,
            phase: LifecyclePhase::Init,
        })
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// The shared session, once started
    pub fn transport(&self) -> Option<&Arc<T>> {
        self.transport.as_ref()
    }

    pub fn state_publisher(&self) -> Option<&Arc<StatePublisher<T>>> {
        self.publisher.as_ref()
    }

    pub fn device_id(&self) -> &str {
        &self.config.device.id
    }

    /// Watch for session state changes, once started
    pub fn connection_watch(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.transport.as_ref().and_then(|t| t.state_watch())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|t| t.is_permanently_disconnected())
    }

    /// Republish "started" every time the session comes back after a loss
    fn spawn_reconnect_watcher(
        mut state_rx: watch::Receiver<ConnectionState>,
        publisher: Arc<StatePublisher<T>>,
    ) -> JoinHandle<()> {
        state_rx.borrow_and_update();

        tokio::spawn(
            async move {
                while state_rx.changed().await.is_ok() {
                    let state = state_rx.borrow_and_update().clone();
                    match state {
                        ConnectionState::Connected => {
                            info!("Session re-established, republishing started state");
                            if let Err(e) = publisher.publish_started().await {
                                warn!(error = %e, "Failed to republish started state");
                            }
                        }
                        ConnectionState::PermanentlyDisconnected(_) => break,
                        _ => {}
                    }
                }
            }
            .instrument(tracing::info_span!("reconnect_watcher")),
        )
    }

    /// Connect, subscribe, announce, and start the heartbeat.
    ///
    /// Connect and subscribe failures are returned; a failed "started"
    /// publish is logged and startup continues.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        if self.phase != LifecyclePhase::Init {
            return Err(LifecycleError::InvalidPhase {
                expected: LifecyclePhase::Init,
                actual: self.phase,
            });
        }

        let span = crate::lifecycle_span!(device_id = %self.config.device.id, phase = "start");
        async {
            info!(device_id = %self.config.device.id, "Starting device agent");
            self.phase = LifecyclePhase::Connecting;

            let mut transport = self
                .pending_transport
                .take()
                .ok_or(LifecycleError::TransportMissing)?;

            transport
                .connect()
                .await
                .map_err(|e| LifecycleError::Connect(e.into()))?;
            info!("Broker session connected");

            let transport = Arc::new(transport);
            self.transport = Some(transport.clone());

            for subscription in device_subscriptions(&self.topics, self.commands.clone())? {
                let filter = subscription.filter.to_string();
                transport.subscribe(subscription).await.map_err(|e| {
                    LifecycleError::Subscribe {
                        filter: filter.clone(),
                        source: e.into(),
                    }
                })?;
            }
            info!("Device subscriptions established");

            let publisher = Arc::new(StatePublisher::new(transport.clone(), self.topics.clone()));
            if let Err(e) = publisher.publish_started().await {
                error!(error = %e.sanitized(), "Failed to publish started state");
            }

            let period = Duration::from_secs(self.config.mqtt.heartbeat_interval_secs);
            self.heartbeat = Some(HeartbeatTicker::spawn(publisher.clone(), period));

            self.reconnect_watcher = transport
                .state_watch()
                .map(|rx| Self::spawn_reconnect_watcher(rx, publisher.clone()));

            self.publisher = Some(publisher);
            self.phase = LifecyclePhase::Running;
            info!("Device agent running");
            Ok::<(), LifecycleError>(())
        }
        .instrument(span)
        .await
    }

    /// Stop the heartbeat, publish "stopped" if allowed, and disconnect.
    /// Safe to call more than once and from any phase.
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        if matches!(
            self.phase,
            LifecyclePhase::Draining | LifecyclePhase::Terminated
        ) {
            return Ok(());
        }

        info!(device_id = %self.config.device.id, "Shutting down device agent");
        self.phase = LifecyclePhase::Draining;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }

        if let Some(watcher) = self.reconnect_watcher.take() {
            watcher.abort();
        }

        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish_stopped().await {
                warn!(error = %e.sanitized(), "Failed to publish stopped state");
            }
        }

        if let Some(transport) = &self.transport {
            let grace = Duration::from_millis(self.config.mqtt.disconnect_grace_ms);
            if let Err(e) = transport.disconnect(grace).await {
                warn!(error = %e, "Broker disconnect failed");
            }
        }

        self.phase = LifecyclePhase::Terminated;
        info!("Device agent shutdown complete");
        Ok(())
    }

    /// Run until `stop` resolves or the session is permanently lost, then
    /// shut down. Shutdown happens whichever way the wait ends.
    pub async fn run_until<F>(&mut self, stop: F) -> Result<StopReason, LifecycleError>
    where
        F: Future<Output = StopReason>,
    {
        let connection = self.connection_watch();

        let reason = tokio::select! {
            reason = stop => reason,
            reason = wait_for_permanent_loss(connection) => StopReason::SessionLost(reason),
        };

        match &reason {
            StopReason::Signal(name) => info!(signal = *name, "Stop signal received"),
            StopReason::SignalSetup(e) => error!(error = %e, "Signal handling unavailable"),
            StopReason::SessionLost(e) => error!(reason = %e, "Broker session permanently lost"),
        }

        self.shutdown().await?;
        Ok(reason)
    }
}

/// Resolves once the session is permanently disconnected
async fn wait_for_permanent_loss(connection: Option<watch::Receiver<ConnectionState>>) -> String {
    let Some(mut rx) = connection else {
        return std::future::pending().await;
    };

    loop {
        if let ConnectionState::PermanentlyDisconnected(reason) = &*rx.borrow_and_update() {
            return reason.clone();
        }
        if rx.changed().await.is_err() {
            return "session closed".to_string();
        }
    }
}

/// Agent lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error")]
    Configuration(#[from] ConfigError),
    #[error("Connecting to the broker failed")]
    Connect(#[source] AgentError),
    #[error("Subscribing to '{filter}' failed")]
    Subscribe {
        filter: String,
        #[source]
        source: AgentError,
    },
    #[error("Invalid subscription filter")]
    Routing(#[from] RoutingError),
    #[error("Transport already consumed")]
    TransportMissing,
    #[error("Lifecycle is in phase {actual:?}, expected {expected:?}")]
    InvalidPhase {
        expected: LifecyclePhase,
        actual: LifecyclePhase,
    },
}

impl From<LifecycleError> for AgentError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::Configuration(e) => AgentError::Config(e),
            LifecycleError::Connect(source) => source,
            LifecycleError::Subscribe { source, .. } => source,
            other => AgentError::internal(other.to_string()),
        }
    }
}
