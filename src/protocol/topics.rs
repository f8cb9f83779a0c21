//! Topic names and validation for the pump bridge
//!
//! Handlers are keyed by exact topic name, so subscriptions and publishes
//! both go through the same name validation. Wildcard filters are rejected.

use thiserror::Error;

/// Numeric water level, percent
pub const DEFAULT_WATER_LEVEL_TOPIC: &str = "water/level";
/// Pump command and echo, `ON` / `OFF`
pub const DEFAULT_PUMP_CONTROL_TOPIC: &str = "water/control";
/// Auto-mode flag, `ON` / `OFF`
pub const DEFAULT_AUTO_MODE_TOPIC: &str = "auto-mode";

/// MQTT limits topic names to a two-byte length prefix
const MAX_TOPIC_LEN: usize = 65_535;

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic exceeds {MAX_TOPIC_LEN} bytes")]
    TooLong,
    #[error("Topic contains wildcard character '{0}'")]
    Wildcard(char),
    #[error("Topic contains a NUL character")]
    NulCharacter,
}

/// Validate a concrete topic name (usable for both publish and exact-match subscribe)
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }

    for ch in topic.chars() {
        match ch {
            '+' | '#' => return Err(TopicError::Wildcard(ch)),
            '\0' => return Err(TopicError::NulCharacter),
            _ => {}
        }
    }

    Ok(())
}
