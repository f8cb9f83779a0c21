//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the bridge and
//! store without an MQTT broker.

pub mod mocks;

pub use mocks::*;
