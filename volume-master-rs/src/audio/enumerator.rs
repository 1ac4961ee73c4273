//! Endpoint directory.
//!
//! Enumerates audio devices through the backend, resolves persistent UIDs
//! to runtime handles and reads the system default output.

use super::device::{AudioDevice, AudioError};
use super::policy;
use super::property::{AudioBackend, ObjectId, PropertyAddress, Scope, Selector, SYSTEM_OBJECT, UNKNOWN_OBJECT};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Device enumerator over an [`AudioBackend`].
#[derive(Clone)]
pub struct DeviceEnumerator {
    backend: Arc<dyn AudioBackend>,
}

impl DeviceEnumerator {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Get every device the system currently exposes.
    ///
    /// Devices that vanish while being read are skipped.
    pub fn get_devices(&self) -> Vec<AudioDevice> {
        self.device_ids()
            .into_iter()
            .filter_map(|id| self.get_device_by_id(id))
            .collect()
    }

    /// Output devices, excluding our own virtual endpoints.
    pub fn output_devices(&self) -> Vec<AudioDevice> {
        self.get_devices()
            .into_iter()
            .filter(|d| d.has_output && !d.is_ours())
            .collect()
    }

    /// Input devices, excluding our own virtual endpoints.
    pub fn input_devices(&self) -> Vec<AudioDevice> {
        self.get_devices()
            .into_iter()
            .filter(|d| d.has_input && !d.is_ours())
            .collect()
    }

    /// UIDs of every present device.
    pub fn device_uids(&self) -> BTreeSet<String> {
        self.get_devices().into_iter().map(|d| d.uid).collect()
    }

    /// Get devices as a HashMap keyed by UID.
    pub fn get_devices_map(&self) -> HashMap<String, AudioDevice> {
        self.get_devices()
            .into_iter()
            .map(|d| (d.uid.clone(), d))
            .collect()
    }

    /// Look up a device by its persistent UID.
    pub fn get_device(&self, uid: &str) -> Result<AudioDevice, AudioError> {
        self.get_devices()
            .into_iter()
            .find(|d| d.uid == uid)
            .ok_or_else(|| AudioError::DeviceNotFound {
                uid: uid.to_string(),
            })
    }

    /// Resolve a UID to its current runtime handle.
    pub fn device_id_for_uid(&self, uid: &str) -> Option<ObjectId> {
        self.get_device(uid).ok().map(|d| d.id)
    }

    /// Read a device record from its handle. `None` if the handle is stale.
    pub fn get_device_by_id(&self, id: ObjectId) -> Option<AudioDevice> {
        let uid = self.text(id, Selector::DeviceUid)?;
        let name = self.text(id, Selector::Name)?;
        let manufacturer = self.text(id, Selector::Manufacturer).unwrap_or_default();
        let transport_type = self
            .backend
            .get(id, PropertyAddress::global(Selector::TransportType))
            .ok()
            .and_then(|v| v.as_u32())
            .unwrap_or(0);

        Some(AudioDevice {
            id,
            uid,
            name,
            manufacturer,
            has_input: self.channel_count(id, Scope::Input) > 0,
            has_output: self.channel_count(id, Scope::Output) > 0,
            transport_type,
        })
    }

    /// Get the current default output device, if any.
    pub fn default_output_device(&self) -> Option<AudioDevice> {
        self.default_device(Selector::DefaultOutputDevice)
    }

    pub fn default_input_device(&self) -> Option<AudioDevice> {
        self.default_device(Selector::DefaultInputDevice)
    }

    /// Make `id` the default output (and system output where settable).
    pub fn set_default_output_device(&self, id: ObjectId) -> Result<(), AudioError> {
        policy::set_default_output_device(self.backend.as_ref(), id)
    }

    fn default_device(&self, selector: Selector) -> Option<AudioDevice> {
        let id = self
            .backend
            .get(SYSTEM_OBJECT, PropertyAddress::global(selector))
            .ok()?
            .as_u32()?;
        if id == UNKNOWN_OBJECT {
            return None;
        }
        self.get_device_by_id(id)
    }

    fn device_ids(&self) -> Vec<ObjectId> {
        self.backend
            .get(SYSTEM_OBJECT, PropertyAddress::global(Selector::Devices))
            .ok()
            .and_then(|v| v.into_list())
            .unwrap_or_default()
    }

    fn text(&self, id: ObjectId, selector: Selector) -> Option<String> {
        self.backend
            .get(id, PropertyAddress::global(selector))
            .ok()?
            .into_text()
    }

    fn channel_count(&self, id: ObjectId, scope: Scope) -> u32 {
        self.backend
            .get(id, PropertyAddress::new(Selector::StreamConfiguration, scope, 0))
            .ok()
            .and_then(|v| v.as_u32())
            .unwrap_or(0)
    }
}
