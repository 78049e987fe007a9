// src/messaging/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to connect to broker at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Failed to send to {destination}: {reason}")]
    Send { destination: String, reason: String },

    #[error("Receive failed on {entity}: {reason}")]
    Receive { entity: String, reason: String },

    #[error("Handler failed for message {message_id}: {reason}")]
    Handler { message_id: String, reason: String },
}

// Custom Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    pub fn configuration(message: impl Into<String>) -> Self {
        BusError::Configuration(message.into())
    }

    pub fn send(destination: impl Into<String>, reason: impl ToString) -> Self {
        BusError::Send {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    pub fn receive(entity: impl Into<String>, reason: impl ToString) -> Self {
        BusError::Receive {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error ends a listening loop rather than just one message.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BusError::Handler { .. })
    }
}
