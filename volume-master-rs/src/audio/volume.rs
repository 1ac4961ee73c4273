//! Volume and mute control for a single endpoint.
//!
//! Reads return `None` when the endpoint or property is gone; writes check
//! settability first and silently skip read-only properties and stale
//! handles.

use super::property::{AudioBackend, ObjectId, PropertyAddress, PropertyValue, Selector};
use tracing::trace;

/// Channel elements watched and written: master, left, right.
pub const MONITORED_CHANNELS: [u32; 3] = [0, 1, 2];

/// Volume controller for a specific endpoint.
#[derive(Clone, Copy)]
pub struct VolumeController<'a> {
    backend: &'a dyn AudioBackend,
    device: ObjectId,
}

impl<'a> VolumeController<'a> {
    pub fn new(backend: &'a dyn AudioBackend, device: ObjectId) -> Self {
        Self { backend, device }
    }

    pub fn device(&self) -> ObjectId {
        self.device
    }

    /// True while the handle still refers to a live endpoint.
    ///
    /// Queries the identity property, which every live device exposes.
    pub fn is_alive(&self) -> bool {
        self.backend
            .has_property(self.device, PropertyAddress::global(Selector::DeviceUid))
    }

    /// Whether the endpoint exposes a volume control on `channel`.
    pub fn has_volume(&self, channel: u32) -> bool {
        self.backend
            .has_property(self.device, PropertyAddress::output_volume(channel))
    }

    /// Get the volume of a channel (0.0 to 1.0).
    pub fn volume(&self, channel: u32) -> Option<f32> {
        let address = PropertyAddress::output_volume(channel);
        if !self.backend.has_property(self.device, address) {
            return None;
        }
        self.backend.get(self.device, address).ok()?.as_f32()
    }

    /// Volume of the first monitored channel the endpoint exposes.
    ///
    /// Master when present, otherwise the left channel.
    pub fn level(&self) -> Option<f32> {
        MONITORED_CHANNELS
            .into_iter()
            .find_map(|channel| self.volume(channel))
    }

    /// Set the volume of a channel (clamped to 0.0..=1.0).
    pub fn set_volume(&self, channel: u32, level: f32) {
        let address = PropertyAddress::output_volume(channel);
        self.write(address, PropertyValue::Float(level.clamp(0.0, 1.0)));
    }

    /// Set every monitored channel to the same level.
    pub fn set_volume_all(&self, level: f32) {
        for channel in MONITORED_CHANNELS {
            self.set_volume(channel, level);
        }
    }

    /// Get the current mute state.
    pub fn mute(&self) -> Option<bool> {
        let address = PropertyAddress::output_mute();
        if !self.backend.has_property(self.device, address) {
            return None;
        }
        self.backend
            .get(self.device, address)
            .ok()?
            .as_u32()
            .map(|v| v != 0)
    }

    /// Set the mute state.
    pub fn set_mute(&self, muted: bool) {
        self.write(PropertyAddress::output_mute(), PropertyValue::UInt(muted as u32));
    }

    fn write(&self, address: PropertyAddress, value: PropertyValue) {
        if !self.backend.is_settable(self.device, address) {
            trace!(device = self.device, %address, "property not settable, skipping");
            return;
        }
        if let Err(e) = self.backend.set(self.device, address, &value) {
            trace!(device = self.device, %address, error = %e, "property write skipped");
        }
    }
}
