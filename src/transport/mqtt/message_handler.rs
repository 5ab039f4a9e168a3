//! Classification of event-loop events
//!
//! The supervisor turns every `rumqttc` event into an [`EventRoute`] and acts
//! on that; keeping the match here makes it testable without a broker.

use crate::protocol::payload_summary;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An inbound application message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK with the broker's return code
    ConnectionAcknowledged { accepted: bool, code: String },
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// SUBACK; `granted` is false when any filter was rejected
    SubscriptionConfirmed { packet_id: u16, granted: bool },
    /// Broker sent DISCONNECT
    Disconnected,
    /// We sent DISCONNECT
    DisconnectSent,
    /// PingResp, PubAck and other bookkeeping
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    accepted: connack.code == ConnectReturnCode::Success,
                    code: format!("{:?}", connack.code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                }),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: Self::validate_subscription_success(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    pub fn validate_subscription_success(return_codes: &[SubscribeReasonCode]) -> bool {
        !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    }
}

/// Hands inbound messages to the dispatcher task
#[derive(Debug, Clone)]
pub struct MessageForwarder {
    sender: mpsc::Sender<InboundMessage>,
}

impl MessageForwarder {
    pub fn new(sender: mpsc::Sender<InboundMessage>) -> Self {
        Self { sender }
    }

    /// Queue a message for dispatch, preserving arrival order.
    ///
    /// Never waits: the event loop has to keep polling to answer keep-alives,
    /// so a message that finds the queue full is dropped and reported.
    pub fn forward(&self, message: InboundMessage) -> Result<(), String> {
        debug!(
            topic = %message.topic,
            size = message.payload.len(),
            payload = %payload_summary(&message.payload),
            "Queueing inbound message"
        );

        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    topic = %message.topic,
                    size = message.payload.len(),
                    "Inbound queue full, dropping message"
                );
                Err(format!(
                    "Inbound queue full, dropped message on '{}'",
                    message.topic
                ))
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                warn!(topic = %message.topic, "Dispatcher is gone, dropping inbound message");
                Err("Dispatcher stopped".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS, SubAck};

    #[test]
    fn test_route_publish() {
        let publish = Publish::new("/devices/dev-1/commands/signal", QoS::AtLeastOnce, b"{}".to_vec());
        let route = MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish)));

        assert_eq!(
            route,
            EventRoute::MessageReceived(InboundMessage {
                topic: "/devices/dev-1/commands/signal".to_string(),
                payload: b"{}".to_vec(),
            })
        );
    }

    #[test]
    fn test_route_connack() {
        let accepted = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&accepted),
            EventRoute::ConnectionAcknowledged { accepted: true, .. }
        ));

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionAcknowledged {
                accepted: false,
                ..
            }
        ));
    }

    #[test]
    fn test_route_suback() {
        let ok = SubAck::new(7, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::SubAck(ok))),
            EventRoute::SubscriptionConfirmed {
                packet_id: 7,
                granted: true
            }
        );

        let rejected = SubAck::new(8, vec![SubscribeReasonCode::Failure]);
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::SubAck(rejected))),
            EventRoute::SubscriptionConfirmed {
                packet_id: 8,
                granted: false
            }
        );
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    fn message(topic: &str, payload: u8) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: vec![payload],
        }
    }

    #[tokio::test]
    async fn test_forwarder_preserves_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let forwarder = MessageForwarder::new(tx);

        for i in 0..3 {
            forwarder.forward(message("/devices/dev-1/config", i)).unwrap();
        }

        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_forwarder_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let forwarder = MessageForwarder::new(tx);

        forwarder.forward(message("/devices/dev-1/commands/signal", 0)).unwrap();
        forwarder.forward(message("/devices/dev-1/commands/signal", 1)).unwrap();

        // Returns immediately instead of waiting for the dispatcher.
        let overflow = forwarder.forward(message("/devices/dev-1/commands/signal", 2));
        assert!(overflow.unwrap_err().contains("queue full"));

        assert_eq!(rx.recv().await.unwrap().payload, vec![0]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);

        // Space is available again once the dispatcher catches up.
        forwarder.forward(message("/devices/dev-1/commands/signal", 3)).unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, vec![3]);
    }

    #[tokio::test]
    async fn test_forwarder_reports_closed_dispatcher() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let forwarder = MessageForwarder::new(tx);
        assert!(forwarder.forward(message("t", 0)).is_err());
    }
}
