//! Reactive pump state store
//!
//! [`SensorStore`] binds [`SensorState`] to the broker bridge: handlers keep
//! it in sync with inbound messages and its actions publish commands.

pub mod sensor_store;
pub mod state;

pub use sensor_store::SensorStore;
pub use state::{SensorState, SwitchField, DEFAULT_AUTO_LEVEL};

use thiserror::Error;

/// Store action errors
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("Auto level must be a finite number, got {0}")]
    InvalidThreshold(f64),
}
