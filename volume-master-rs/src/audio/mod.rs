//! Audio module for CoreAudio-style endpoint access.
//!
//! This module provides device enumeration, per-channel volume and mute
//! control, default output routing, aggregate endpoint management and device
//! list notifications, all on top of the [`AudioBackend`] seam.

pub mod device;
pub mod enumerator;
pub mod monitor;
pub mod notifications;
pub mod policy;
pub mod property;
pub mod simulated;
pub mod volume;

pub use device::{is_our_uid, AudioDevice, AudioError, DeviceEvent, AGGREGATE_UID_PREFIX};
pub use enumerator::DeviceEnumerator;
pub use monitor::DeviceMonitor;
pub use property::{
    AggregateDescription, AudioBackend, ListenerSink, ListenerToken, ObjectId, PropertyAddress,
    PropertyValue, Scope, Selector, SubDevice,
};
pub use simulated::{SimulatedBackend, SimulatedDevice};
pub use volume::{VolumeController, MONITORED_CHANNELS};
