//! Wire-level vocabulary for the pump topics
//!
//! Topics carry plain UTF-8 text. This module names the topics and gives
//! their payloads types.

pub mod payload;
pub mod topics;

pub use payload::*;
pub use topics::*;
