//! MQTT client implementation for the pump bridge
//!
//! - [`connection`]: broker URL schemes, `MqttOptions`, connection states and backoff
//! - [`message_handler`]: classifies rumqttc events and forwards inbound publishes
//! - [`health_monitor`]: state transitions and the reconnect decision
//! - [`client`]: `MqttClient` and the supervisor task that drives the event loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use pump_bridge::config::MqttSection;
//! use pump_bridge::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection::local("ws://localhost:9001/mqtt");
//!
//! let mut client = MqttClient::new(config)?;
//! client.connect().await?;
//! client.subscribe("water/level").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{BrokerScheme, ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
