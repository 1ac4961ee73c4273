//! Endpoint property addressing and the backend seam.
//!
//! Every interaction with the OS audio subsystem goes through
//! [`AudioBackend`]: uniform get/set/observe primitives over object
//! properties, plus creation and destruction of aggregate endpoints.

use super::device::AudioError;
use std::fmt;
use std::sync::Arc;

/// Runtime handle of an audio object. Valid only for the current session.
pub type ObjectId = u32;

/// The audio system object (`kAudioObjectSystemObject`).
pub const SYSTEM_OBJECT: ObjectId = 1;

/// Sentinel for "no object" (`kAudioObjectUnknown`).
pub const UNKNOWN_OBJECT: ObjectId = 0;

/// The master element of a property.
pub const ELEMENT_MAIN: u32 = 0;

/// Property selectors used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Persistent identity string of a device
    DeviceUid,
    /// Display name
    Name,
    Manufacturer,
    /// Transport type four-char code
    TransportType,
    /// Volume scalar (0.0 to 1.0), per channel element
    VolumeScalar,
    /// Mute state (0 or 1)
    Mute,
    /// Pair of channel numbers used for stereo output
    PreferredChannelsForStereo,
    /// Total channel count of the stream configuration
    StreamConfiguration,
    /// Device list of the system object
    Devices,
    /// System default output device
    DefaultOutputDevice,
    /// System alert/sound-effect output device
    DefaultSystemOutputDevice,
    /// System default input device
    DefaultInputDevice,
}

/// Property scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Output,
    Input,
}

/// Fully qualified property address: selector, scope and element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAddress {
    pub selector: Selector,
    pub scope: Scope,
    pub element: u32,
}

impl PropertyAddress {
    pub const fn new(selector: Selector, scope: Scope, element: u32) -> Self {
        Self {
            selector,
            scope,
            element,
        }
    }

    /// Global scope, main element.
    pub const fn global(selector: Selector) -> Self {
        Self::new(selector, Scope::Global, ELEMENT_MAIN)
    }

    /// Output scope, main element.
    pub const fn output(selector: Selector) -> Self {
        Self::new(selector, Scope::Output, ELEMENT_MAIN)
    }

    /// Output volume of a single channel (0 = master).
    pub const fn output_volume(channel: u32) -> Self {
        Self::new(Selector::VolumeScalar, Scope::Output, channel)
    }

    /// Output mute on the main element.
    pub const fn output_mute() -> Self {
        Self::output(Selector::Mute)
    }
}

impl fmt::Display for PropertyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{}", self.selector, self.scope, self.element)
    }
}

/// A property value as exchanged with the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Float(f32),
    UInt(u32),
    Text(String),
    UIntList(Vec<u32>),
}

impl PropertyValue {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<u32>> {
        match self {
            PropertyValue::UIntList(v) => Some(v),
            _ => None,
        }
    }
}

/// Callback invoked by the backend when observed properties change.
///
/// Runs on an OS-owned thread. Implementations must only capture the event
/// and hand it to the coordinator.
pub type ListenerSink = Arc<dyn Fn(ObjectId, &[PropertyAddress]) + Send + Sync>;

/// Registration of a property listener, returned by [`AudioBackend::add_listener`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    pub object: ObjectId,
    pub address: PropertyAddress,
    pub(crate) id: u64,
}

/// One member of an aggregate endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDevice {
    pub uid: String,
    /// Only one sub-device can be the clock master, the others need drift correction
    pub drift_compensation: bool,
}

/// Everything the OS needs to build an aggregate endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDescription {
    pub name: String,
    pub uid: String,
    pub sub_devices: Vec<SubDevice>,
    /// UID of the timing master sub-device
    pub master_uid: String,
    pub is_private: bool,
    /// Stacked aggregates concatenate channels instead of mirroring them
    pub is_stacked: bool,
}

/// Property access over OS audio objects.
///
/// All methods are non-blocking relative to the caller except aggregate
/// creation, which the OS performs synchronously.
pub trait AudioBackend: Send + Sync {
    /// Whether the object exposes the property. False for stale handles.
    fn has_property(&self, object: ObjectId, address: PropertyAddress) -> bool;

    /// Whether the property can be written.
    fn is_settable(&self, object: ObjectId, address: PropertyAddress) -> bool;

    fn get(&self, object: ObjectId, address: PropertyAddress) -> Result<PropertyValue, AudioError>;

    fn set(
        &self,
        object: ObjectId,
        address: PropertyAddress,
        value: &PropertyValue,
    ) -> Result<(), AudioError>;

    /// Register `sink` for changes of `address` on `object`.
    fn add_listener(
        &self,
        object: ObjectId,
        address: PropertyAddress,
        sink: ListenerSink,
    ) -> Result<ListenerToken, AudioError>;

    /// Unregister a listener on an object that still exists.
    fn remove_listener(&self, token: ListenerToken) -> Result<(), AudioError>;

    /// Drop the bookkeeping of a listener whose object has disappeared.
    fn discard_listener(&self, token: ListenerToken);

    fn create_aggregate(&self, description: &AggregateDescription) -> Result<ObjectId, AudioError>;

    fn destroy_aggregate(&self, object: ObjectId) -> Result<(), AudioError>;
}
