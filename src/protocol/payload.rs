//! Typed payload codec
//!
//! Every topic carries unstructured text. [`TopicPayload`] maps that text to
//! and from a Rust type so handlers never parse strings themselves.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Payload decoding errors
#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("Payload '{0}' is not a number")]
    InvalidNumber(String),
    #[error("Payload '{0}' is not a finite number")]
    NotFinite(String),
}

/// A value carried as text on a topic
pub trait TopicPayload: Sized + Send + 'static {
    fn decode(payload: &str) -> Result<Self, PayloadError>;
    fn encode(&self) -> String;
}

/// On/off state carried on the pump and auto-mode topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchState {
    On,
    #[default]
    Off,
}

impl SwitchState {
    pub fn is_on(self) -> bool {
        matches!(self, SwitchState::On)
    }

    pub fn toggled(self) -> Self {
        match self {
            SwitchState::On => SwitchState::Off,
            SwitchState::Off => SwitchState::On,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwitchState::On => "ON",
            SwitchState::Off => "OFF",
        }
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

impl From<SwitchState> for bool {
    fn from(state: SwitchState) -> Self {
        state.is_on()
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TopicPayload for SwitchState {
    /// Exactly `ON` means on; any other text means off.
    fn decode(payload: &str) -> Result<Self, PayloadError> {
        Ok(SwitchState::from(payload == "ON"))
    }

    fn encode(&self) -> String {
        self.as_str().to_string()
    }
}

impl TopicPayload for f64 {
    fn decode(payload: &str) -> Result<Self, PayloadError> {
        let trimmed = payload.trim();
        let value: f64 = trimmed
            .parse()
            .map_err(|_| PayloadError::InvalidNumber(payload.to_string()))?;
        if !value.is_finite() {
            return Err(PayloadError::NotFinite(payload.to_string()));
        }
        Ok(value)
    }

    fn encode(&self) -> String {
        self.to_string()
    }
}

impl TopicPayload for String {
    fn decode(payload: &str) -> Result<Self, PayloadError> {
        Ok(payload.to_string())
    }

    fn encode(&self) -> String {
        self.clone()
    }
}
