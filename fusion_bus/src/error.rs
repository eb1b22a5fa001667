//! Error types for the bus abstraction layer.

use thiserror::Error;

/// Errors that can occur while talking to the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not establish or re-use a connection to the bus
    #[error("Bus connection error: {0}")]
    Connection(String),

    /// A publish call failed (connection dropped, bus refused, etc.)
    #[error("Publish failed on topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// The subscribe consume loop hit a fatal error
    #[error("Subscription failed on topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Payload could not be decoded off the wire
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BusError {
    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a publish error for a topic.
    pub fn publish(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Publish {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a subscribe error for a topic.
    pub fn subscribe(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}
