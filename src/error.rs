//! Error types for bridge operations
//!
//! Transport, configuration and payload errors each have their own enum in
//! their module; [`BridgeError`] is what the broker bridge returns.

use crate::protocol::{PayloadError, TopicError};
use thiserror::Error;

/// Main error type for broker bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge not initialized")]
    NotInitialized,

    #[error("Bridge already initialized")]
    AlreadyInitialized,

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
