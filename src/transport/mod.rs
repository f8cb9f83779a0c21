//! Transport layer for broker communication
//!
//! This module provides the transport abstraction the bridge talks to and
//! its MQTT implementation.

use tokio::sync::mpsc;

pub mod mqtt;

/// A publish received from the broker, payload already decoded as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Transport trait for broker communication
///
/// This trait provides an abstraction over the broker connection
/// to enable dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to an exact topic; replayed after every reconnection
    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Drop a topic subscription
    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<crate::transport::mqtt::ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;

    /// Set the sender inbound publishes are forwarded to
    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
