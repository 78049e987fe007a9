// src/rabbitmq/errors.rs
// Translate lapin errors into bus errors, keeping the broker's reply text.

use lapin::Error as LapinError;

use crate::messaging::{BusError, ConnectionId};

/// Human-readable reason for a lapin error.
pub(crate) fn describe(error: &LapinError) -> String {
    // Use string representation for classification
    let error_text = error.to_string();

    if error_text.contains("NOT_FOUND") {
        format!("destination not found ({})", error_text)
    } else if error_text.contains("ACCESS_REFUSED") {
        format!("access refused ({})", error_text)
    } else if error_text.contains("PRECONDITION_FAILED") {
        format!("destination exists with different settings ({})", error_text)
    } else if error_text.contains("InvalidChannelState") || error_text.contains("InvalidConnectionState") {
        format!("channel no longer usable ({})", error_text)
    } else {
        error_text
    }
}

pub(crate) fn connect_error(id: &ConnectionId, error: &LapinError) -> BusError {
    BusError::Connect {
        endpoint: id.to_string(),
        reason: describe(error),
    }
}

pub(crate) fn send_error(destination: &str, error: &LapinError) -> BusError {
    BusError::send(destination, describe(error))
}

pub(crate) fn receive_error(entity: &str, error: &LapinError) -> BusError {
    BusError::receive(entity, describe(error))
}
