//! Error taxonomy for device operations.
//!
//! Every failure that crosses a component boundary is a [`DeviceError`].
//! Agent-level transport failures start out as [`AgentError`] and are
//! converted at the registry/dispatcher boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure raised by a device agent (capture, tap, handshake...).
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("device rejected command: {0}")]
    Rejected(String),

    #[error("handshake failed with {address}: {reason}")]
    Handshake { address: String, reason: String },
}

/// Errors returned by the device-access core.
///
/// `Clone` so that a single coalesced failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unrecognized event type: {0}")]
    Unrecognized(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("worker queue is full")]
    QueueFull,

    #[error("service is shutting down")]
    ShuttingDown,
}

/// Serializable error category, used in structured results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    Timeout,
    Unrecognized,
    Cancelled,
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unavailable(_) | Self::QueueFull | Self::ShuttingDown => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unrecognized(_) | Self::InvalidEvent(_) => ErrorKind::Unrecognized,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// HTTP-ish status code for the router layer.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Unavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Unrecognized => 400,
            ErrorKind::Cancelled => 499,
        }
    }

    /// Whether this failure says something about the device's connection.
    ///
    /// Only these mark a pooled connection unhealthy.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<AgentError> for DeviceError {
    fn from(err: AgentError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_maps_to_unavailable() {
        let err: DeviceError = AgentError::Transport("reset by peer".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.to_string().contains("reset by peer"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(DeviceError::NotFound("d".into()).status_code(), 404);
        assert_eq!(DeviceError::QueueFull.status_code(), 503);
        assert_eq!(DeviceError::Timeout(Duration::from_secs(1)).status_code(), 504);
        assert_eq!(DeviceError::Unrecognized("x".into()).status_code(), 400);
        assert_eq!(DeviceError::InvalidEvent("x".into()).status_code(), 400);
    }

    #[test]
    fn test_device_fault_classification() {
        assert!(DeviceError::Unavailable("x".into()).is_device_fault());
        assert!(DeviceError::Timeout(Duration::from_millis(5)).is_device_fault());
        assert!(!DeviceError::NotFound("x".into()).is_device_fault());
        assert!(!DeviceError::Cancelled("x".into()).is_device_fault());
        assert!(!DeviceError::QueueFull.is_device_fault());
    }
}
