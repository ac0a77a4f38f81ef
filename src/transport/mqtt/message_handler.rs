//! Pure routing of `rumqttc` events

use crate::transport::TransportEvent;
use rumqttc::{ConnectReturnCode, Event, Packet};

/// What the transport should do with one event loop event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    ConnectionAcknowledged(ConnectReturnCode),
    MessageReceived { topic: String, payload: Vec<u8> },
    Disconnected,
    /// Pings, acks and other protocol traffic
    InfrastructureEvent(String),
    OutgoingEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => EventRoute::ConnectionAcknowledged(ack.code),
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Session-facing event for a route, if the session cares about it
    pub fn to_transport_event(route: EventRoute) -> Option<TransportEvent> {
        match route {
            EventRoute::ConnectionAcknowledged(_) => Some(TransportEvent::Connected),
            EventRoute::MessageReceived { topic, payload } => {
                Some(TransportEvent::Message { topic, payload })
            }
            EventRoute::Disconnected => Some(TransportEvent::ConnectionLost {
                reason: "broker closed the connection".to_string(),
            }),
            EventRoute::InfrastructureEvent(_) | EventRoute::OutgoingEvent => None,
        }
    }
}
