//! Pure routing of rumqttc events
//!
//! Turns raw v5 events into [`EventRoute`] decisions the event-loop thread acts
//! on, and decides which publishes reach the inbound callback.

use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
                retain: publish.retain,
            },
            Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
            Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionConfirmed {
                packet_id: suback.pkid,
            },
            Event::Incoming(_) => EventRoute::InfrastructureEvent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Retained frames are stale commands from an earlier session and are never replayed
    pub fn should_process_message(topic: &str, retain: bool, subscriptions: &[String]) -> bool {
        if retain {
            debug!(topic = %topic, "Ignoring retained message");
            return false;
        }

        if !subscriptions.iter().any(|subscribed| subscribed == topic) {
            debug!(topic = %topic, "Ignoring message on unsubscribed topic");
            return false;
        }

        true
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnected,
    SubscriptionConfirmed { packet_id: u16 },
    /// PingResp, PubAck and similar
    InfrastructureEvent,
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;

    fn publish_event(topic: &str, payload: &[u8], retain: bool) -> Event {
        Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain,
            topic: Bytes::copy_from_slice(topic.as_bytes()),
            pkid: 1,
            payload: Bytes::copy_from_slice(payload),
            properties: None,
        }))
    }

    #[test]
    fn test_route_publish() {
        let route = MessageHandler::route_mqtt_event(&publish_event(
            "/hydros/commands/coordination/c1",
            br#"{"command_id":"x"}"#,
            false,
        ));
        assert_eq!(
            route,
            EventRoute::MessageReceived {
                topic: "/hydros/commands/coordination/c1".to_string(),
                payload: br#"{"command_id":"x"}"#.to_vec(),
                retain: false,
            }
        );
    }

    #[test]
    fn test_route_connection_events() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );
    }

    #[test]
    fn test_retained_publish_is_routed_with_flag() {
        let route = MessageHandler::route_mqtt_event(&publish_event("/t", b"{}", true));
        assert!(matches!(route, EventRoute::MessageReceived { retain: true, .. }));
    }

    #[test]
    fn test_retained_messages_ignored() {
        let subscriptions = vec!["/t".to_string()];
        assert!(!MessageHandler::should_process_message("/t", true, &subscriptions));
        assert!(MessageHandler::should_process_message("/t", false, &subscriptions));
    }

    #[test]
    fn test_unsubscribed_topic_ignored() {
        let subscriptions = vec!["/t".to_string()];
        assert!(!MessageHandler::should_process_message("/other", false, &subscriptions));
    }
}
