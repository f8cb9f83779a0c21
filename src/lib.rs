//! pump-bridge
//!
//! Typed MQTT pub/sub bridge and reactive state store for a water pump
//! controller.
//!
//! # Overview
//!
//! - [`bridge::BrokerBridge`] owns one broker connection and dispatches
//!   inbound messages to handlers registered per exact topic
//! - [`store::SensorStore`] keeps water level, pump status, auto-mode and
//!   threshold in sync with the broker and publishes the commands its
//!   actions imply
//! - [`transport::mqtt::MqttClient`] is the rumqttc-backed transport with
//!   reconnection and subscription replay
//!
//! # Quick Start
//!
//! ```rust
//! use pump_bridge::store::SensorStore;
//! use pump_bridge::testing::MockTransport;
//!
//! # tokio_test::block_on(async {
//! let store: SensorStore<MockTransport> = SensorStore::default();
//! store.setup_mqtt(MockTransport::new()).await;
//!
//! store.bridge().dispatch("water/level", "73.5");
//! assert_eq!(store.snapshot().water_level, 73.5);
//! # });
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod store;
pub mod testing;
pub mod transport;

pub use bridge::{BrokerBridge, Handler, HandlerId};
pub use config::*;
pub use error::{BridgeError, BridgeResult};
pub use protocol::*;
pub use store::{SensorState, SensorStore, StoreError, SwitchField};
pub use transport::mqtt::MqttClient;
