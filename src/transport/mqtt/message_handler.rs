//! Classification of rumqttc events and the forwarder that hands inbound
//! publishes to the bridge dispatcher

use crate::transport::InboundMessage;
use rumqttc::v5::{mqttbytes::QoS, Event};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MessageHandler;

impl MessageHandler {
    /// Map a polled event to what the supervisor should do with it
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        return_codes: suback
                            .return_codes
                            .iter()
                            .map(|code| Self::subscribe_code_byte(code))
                            .collect(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    fn subscribe_code_byte(code: &rumqttc::v5::mqttbytes::v5::SubscribeReasonCode) -> u8 {
        use rumqttc::v5::mqttbytes::v5::SubscribeReasonCode;
        match code {
            SubscribeReasonCode::Success(QoS::AtMostOnce) => 0x00,
            SubscribeReasonCode::Success(QoS::AtLeastOnce) => 0x01,
            SubscribeReasonCode::Success(QoS::ExactlyOnce) => 0x02,
            _ => 0x80,
        }
    }

    /// Payload as text; invalid UTF-8 is replaced, not rejected
    pub fn payload_text(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }

    /// Any reason code at or above 0x80 is a refusal
    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.iter().any(|&code| code >= 0x80) {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Hands inbound publishes to whoever registered a sender
#[derive(Clone)]
pub struct MessageForwarder {
    sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self { sender: None }
    }

    pub fn set_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.sender = Some(sender);
    }

    pub fn clear_sender(&mut self) {
        self.sender = None;
    }

    /// Forward one inbound message to the dispatcher
    pub async fn forward(&self, message: InboundMessage) -> Result<(), String> {
        match &self.sender {
            Some(sender) => {
                debug!(topic = %message.topic, "Forwarding inbound message");
                sender
                    .send(message)
                    .await
                    .map_err(|e| format!("Failed to forward message to dispatcher: {e}"))
            }
            None => {
                warn!(
                    topic = %message.topic,
                    "Received MQTT message but no dispatcher attached - message dropped"
                );
                Err("No message sender configured".to_string())
            }
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}
