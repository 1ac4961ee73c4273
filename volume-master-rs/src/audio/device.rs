//! Audio device data models.
//!
//! Defines the endpoint record read from the OS, the change events the
//! device monitor produces, and the audio error type.

use super::property::ObjectId;
use std::collections::BTreeSet;
use thiserror::Error;

/// UID prefix reserved for virtual endpoints created by this application.
pub const AGGREGATE_UID_PREFIX: &str = "com.volumemaster.multioutput.";

/// Transport type of aggregate devices (`'grup'`).
pub const TRANSPORT_TYPE_AGGREGATE: u32 = u32::from_be_bytes(*b"grup");

/// An audio endpoint as enumerated from the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    /// Runtime handle, invalid once the device disconnects
    pub id: ObjectId,

    /// Persistent identity string (stable across reboots)
    pub uid: String,

    /// Human-readable device name
    pub name: String,

    pub manufacturer: String,

    /// Whether the device has input channels
    pub has_input: bool,

    /// Whether the device has output channels
    pub has_output: bool,

    /// Transport type four-char code
    pub transport_type: u32,
}

impl AudioDevice {
    /// True for any aggregate endpoint, ours or not.
    pub fn is_aggregate(&self) -> bool {
        self.transport_type == TRANSPORT_TYPE_AGGREGATE
    }

    /// True if this endpoint was created by this application.
    pub fn is_ours(&self) -> bool {
        is_our_uid(&self.uid)
    }
}

/// True if `uid` carries the reserved virtual endpoint prefix.
pub fn is_our_uid(uid: &str) -> bool {
    uid.starts_with(AGGREGATE_UID_PREFIX)
}

/// Events from the device monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device list changed
    DevicesChanged {
        connected: BTreeSet<String>,
        disconnected: BTreeSet<String>,
    },
}

/// Audio subsystem error types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AudioError {
    #[error("Endpoint {object} no longer exists")]
    EndpointNotFound { object: ObjectId },

    #[error("Device not found: {uid}")]
    DeviceNotFound { uid: String },

    #[error("Property not available on this endpoint")]
    PropertyNotFound,

    #[error("Property is not settable")]
    PropertyNotSettable,

    #[error("Unexpected property value type")]
    TypeMismatch,

    #[error("Aggregate device creation failed with status {0}")]
    CreationFailed(i32),

    #[error("{context} failed with OSStatus {status}")]
    OsStatus { status: i32, context: &'static str },
}

impl AudioError {
    /// Errors that are handled by skipping the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AudioError::EndpointNotFound { .. }
                | AudioError::PropertyNotFound
                | AudioError::PropertyNotSettable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(uid: &str, transport_type: u32) -> AudioDevice {
        AudioDevice {
            id: 40,
            uid: uid.to_string(),
            name: "Test".to_string(),
            manufacturer: String::new(),
            has_input: false,
            has_output: true,
            transport_type,
        }
    }

    #[test]
    fn test_our_uid_prefix() {
        assert!(device("com.volumemaster.multioutput.1234", TRANSPORT_TYPE_AGGREGATE).is_ours());
        assert!(!device("BuiltInSpeakerDevice", 0).is_ours());
        assert!(!device("com.apple.aggregate.1234", TRANSPORT_TYPE_AGGREGATE).is_ours());
    }

    #[test]
    fn test_aggregate_transport() {
        assert!(device("x", TRANSPORT_TYPE_AGGREGATE).is_aggregate());
        assert!(!device("x", u32::from_be_bytes(*b"usb ")).is_aggregate());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(AudioError::EndpointNotFound { object: 7 }.is_recoverable());
        assert!(AudioError::PropertyNotSettable.is_recoverable());
        assert!(!AudioError::CreationFailed(-50).is_recoverable());
    }
}
