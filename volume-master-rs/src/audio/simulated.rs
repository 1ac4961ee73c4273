//! In-memory audio backend.
//!
//! Behaves like the OS audio subsystem closely enough to drive the merge
//! engine without hardware: devices with per-channel volume, mute, stale
//! handles after disconnect, aggregate creation and property listeners that
//! fire on change. Used by the test suite and on hosts without CoreAudio.

use super::device::{AudioError, TRANSPORT_TYPE_AGGREGATE};
use super::property::{
    AggregateDescription, AudioBackend, ListenerSink, ListenerToken, ObjectId, PropertyAddress,
    PropertyValue, Scope, Selector, SYSTEM_OBJECT, UNKNOWN_OBJECT,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// `kAudioHardwareBadDeviceError` ('!dev').
const BAD_DEVICE_ERROR: i32 = i32::from_be_bytes(*b"!dev");

/// Blueprint for a simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub uid: String,
    pub name: String,
    pub manufacturer: String,
    pub transport_type: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    /// Volume elements exposed by the device
    pub volume_channels: Vec<u32>,
    pub volume_settable: bool,
    pub has_mute: bool,
    pub initial_volume: f32,
}

impl SimulatedDevice {
    /// A stereo output with master, left and right volume and a mute control.
    pub fn output(uid: &str, name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            manufacturer: "Simulated".to_string(),
            transport_type: u32::from_be_bytes(*b"usb "),
            input_channels: 0,
            output_channels: 2,
            volume_channels: vec![0, 1, 2],
            volume_settable: true,
            has_mute: true,
            initial_volume: 0.5,
        }
    }

    /// A microphone without output channels.
    pub fn input(uid: &str, name: &str) -> Self {
        Self {
            input_channels: 1,
            output_channels: 0,
            volume_channels: Vec::new(),
            has_mute: false,
            ..Self::output(uid, name)
        }
    }

    /// Only the master volume element is exposed.
    pub fn master_only(mut self) -> Self {
        self.volume_channels = vec![0];
        self
    }

    /// Only per-channel volume elements are exposed.
    pub fn stereo_only(mut self) -> Self {
        self.volume_channels = vec![1, 2];
        self
    }

    /// Volume can be read but not written (e.g. HDMI outputs).
    pub fn read_only(mut self) -> Self {
        self.volume_settable = false;
        self
    }

    pub fn with_volume(mut self, level: f32) -> Self {
        self.initial_volume = level;
        self
    }
}

struct DeviceState {
    profile: SimulatedDevice,
    volumes: HashMap<u32, f32>,
    muted: bool,
    preferred_stereo: Vec<u32>,
    aggregate: Option<AggregateDescription>,
}

impl DeviceState {
    fn new(profile: SimulatedDevice) -> Self {
        let volumes = profile
            .volume_channels
            .iter()
            .map(|&ch| (ch, profile.initial_volume))
            .collect();
        Self {
            profile,
            volumes,
            muted: false,
            preferred_stereo: vec![1, 2],
            aggregate: None,
        }
    }
}

struct Listener {
    object: ObjectId,
    address: PropertyAddress,
    sink: ListenerSink,
}

struct State {
    devices: BTreeMap<ObjectId, DeviceState>,
    default_output: ObjectId,
    default_system_output: ObjectId,
    default_input: ObjectId,
    listeners: HashMap<u64, Listener>,
    next_object: ObjectId,
    next_listener: u64,
    create_failure: Option<i32>,
    default_output_failure: Option<i32>,
    stale_removals: usize,
}

/// In-memory [`AudioBackend`].
pub struct SimulatedBackend {
    state: Mutex<State>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                devices: BTreeMap::new(),
                default_output: UNKNOWN_OBJECT,
                default_system_output: UNKNOWN_OBJECT,
                default_input: UNKNOWN_OBJECT,
                listeners: HashMap::new(),
                next_object: 100,
                next_listener: 1,
                create_failure: None,
                default_output_failure: None,
                stale_removals: 0,
            }),
        }
    }

    /// Backend preloaded with built-in speakers (the default) and two
    /// external outputs, for running without real hardware.
    pub fn with_demo_devices() -> Self {
        let backend = Self::new();
        backend.add_device(SimulatedDevice::output("BuiltInSpeakerDevice", "MacBook Speakers"));
        backend.add_device(SimulatedDevice::output("usb-left-monitor", "Left Monitor"));
        backend.add_device(SimulatedDevice::output("usb-right-monitor", "Right Monitor").master_only());
        backend.add_device(SimulatedDevice::input("BuiltInMicrophoneDevice", "MacBook Microphone"));
        backend
    }

    /// Connect a device. The first output becomes the default output.
    pub fn add_device(&self, profile: SimulatedDevice) -> ObjectId {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_object;
            state.next_object += 1;
            let is_output = profile.output_channels > 0;
            let is_input = profile.input_channels > 0;
            state.devices.insert(id, DeviceState::new(profile));
            if is_output && state.default_output == UNKNOWN_OBJECT {
                state.default_output = id;
                state.default_system_output = id;
            }
            if is_input && state.default_input == UNKNOWN_OBJECT {
                state.default_input = id;
            }
            id
        };
        self.notify(SYSTEM_OBJECT, &[PropertyAddress::global(Selector::Devices)]);
        id
    }

    /// Physically disconnect a device. Its handle becomes stale.
    pub fn disconnect(&self, uid: &str) -> bool {
        let Some(id) = self.device_id(uid) else {
            return false;
        };
        let default_changed = {
            let mut state = self.state.lock();
            state.devices.remove(&id);
            Self::repair_defaults(&mut state, id)
        };
        let mut changed = vec![PropertyAddress::global(Selector::Devices)];
        if default_changed {
            changed.push(PropertyAddress::global(Selector::DefaultOutputDevice));
        }
        self.notify(SYSTEM_OBJECT, &changed);
        true
    }

    /// Make the next aggregate creation fail with `status`.
    pub fn fail_next_create(&self, status: i32) {
        self.state.lock().create_failure = Some(status);
    }

    /// Make the next default output switch fail with `status`.
    pub fn fail_next_default_output(&self, status: i32) {
        self.state.lock().default_output_failure = Some(status);
    }

    pub fn device_id(&self, uid: &str) -> Option<ObjectId> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|(_, d)| d.profile.uid == uid)
            .map(|(id, _)| *id)
    }

    pub fn default_output_uid(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .devices
            .get(&state.default_output)
            .map(|d| d.profile.uid.clone())
    }

    /// Descriptions of every live aggregate.
    pub fn aggregates(&self) -> Vec<AggregateDescription> {
        self.state
            .lock()
            .devices
            .values()
            .filter_map(|d| d.aggregate.clone())
            .collect()
    }

    pub fn preferred_stereo(&self, object: ObjectId) -> Option<Vec<u32>> {
        self.state
            .lock()
            .devices
            .get(&object)
            .map(|d| d.preferred_stereo.clone())
    }

    /// Number of listeners registered on `object`.
    pub fn listener_count(&self, object: ObjectId) -> usize {
        self.state
            .lock()
            .listeners
            .values()
            .filter(|l| l.object == object)
            .count()
    }

    /// How often `remove_listener` was called for an object that no longer exists.
    pub fn stale_removals(&self) -> usize {
        self.state.lock().stale_removals
    }

    fn repair_defaults(state: &mut State, removed: ObjectId) -> bool {
        let fallback = state
            .devices
            .iter()
            .find(|(_, d)| d.profile.output_channels > 0 && d.aggregate.is_none())
            .map(|(id, _)| *id)
            .unwrap_or(UNKNOWN_OBJECT);
        let mut changed = false;
        if state.default_output == removed {
            state.default_output = fallback;
            changed = true;
        }
        if state.default_system_output == removed {
            state.default_system_output = fallback;
        }
        if state.default_input == removed {
            state.default_input = UNKNOWN_OBJECT;
        }
        changed
    }

    fn notify(&self, object: ObjectId, changed: &[PropertyAddress]) {
        // Sinks run without the lock held, as the OS does on its own thread.
        let sinks: Vec<(ListenerSink, Vec<PropertyAddress>)> = {
            let state = self.state.lock();
            state
                .listeners
                .values()
                .filter(|l| l.object == object)
                .filter_map(|l| {
                    let hits: Vec<_> = changed.iter().copied().filter(|a| *a == l.address).collect();
                    (!hits.is_empty()).then(|| (l.sink.clone(), hits))
                })
                .collect()
        };
        for (sink, addresses) in sinks {
            sink(object, &addresses);
        }
    }

    fn has_property_locked(state: &State, object: ObjectId, address: PropertyAddress) -> bool {
        if object == SYSTEM_OBJECT {
            return address.scope == Scope::Global
                && matches!(
                    address.selector,
                    Selector::Devices
                        | Selector::DefaultOutputDevice
                        | Selector::DefaultSystemOutputDevice
                        | Selector::DefaultInputDevice
                );
        }
        let Some(device) = state.devices.get(&object) else {
            return false;
        };
        match address.selector {
            Selector::DeviceUid | Selector::Name | Selector::Manufacturer | Selector::TransportType => {
                address.scope == Scope::Global
            }
            Selector::VolumeScalar => {
                address.scope == Scope::Output && device.volumes.contains_key(&address.element)
            }
            Selector::Mute => address.scope == Scope::Output && device.profile.has_mute,
            Selector::PreferredChannelsForStereo => {
                address.scope == Scope::Output && device.profile.output_channels > 0
            }
            Selector::StreamConfiguration => address.scope != Scope::Global,
            _ => false,
        }
    }

    fn missing(state: &State, object: ObjectId) -> AudioError {
        if object != SYSTEM_OBJECT && !state.devices.contains_key(&object) {
            AudioError::EndpointNotFound { object }
        } else {
            AudioError::PropertyNotFound
        }
    }
}

impl AudioBackend for SimulatedBackend {
    fn has_property(&self, object: ObjectId, address: PropertyAddress) -> bool {
        Self::has_property_locked(&self.state.lock(), object, address)
    }

    fn is_settable(&self, object: ObjectId, address: PropertyAddress) -> bool {
        let state = self.state.lock();
        if !Self::has_property_locked(&state, object, address) {
            return false;
        }
        if object == SYSTEM_OBJECT {
            return address.selector != Selector::Devices;
        }
        match address.selector {
            Selector::VolumeScalar => state
                .devices
                .get(&object)
                .map(|d| d.profile.volume_settable)
                .unwrap_or(false),
            Selector::Mute | Selector::PreferredChannelsForStereo => true,
            _ => false,
        }
    }

    fn get(&self, object: ObjectId, address: PropertyAddress) -> Result<PropertyValue, AudioError> {
        let state = self.state.lock();
        if !Self::has_property_locked(&state, object, address) {
            return Err(Self::missing(&state, object));
        }
        if object == SYSTEM_OBJECT {
            return Ok(match address.selector {
                Selector::Devices => PropertyValue::UIntList(state.devices.keys().copied().collect()),
                Selector::DefaultOutputDevice => PropertyValue::UInt(state.default_output),
                Selector::DefaultSystemOutputDevice => PropertyValue::UInt(state.default_system_output),
                _ => PropertyValue::UInt(state.default_input),
            });
        }
        let device = &state.devices[&object];
        Ok(match address.selector {
            Selector::DeviceUid => PropertyValue::Text(device.profile.uid.clone()),
            Selector::Name => PropertyValue::Text(device.profile.name.clone()),
            Selector::Manufacturer => PropertyValue::Text(device.profile.manufacturer.clone()),
            Selector::TransportType => PropertyValue::UInt(device.profile.transport_type),
            Selector::VolumeScalar => PropertyValue::Float(device.volumes[&address.element]),
            Selector::Mute => PropertyValue::UInt(device.muted as u32),
            Selector::PreferredChannelsForStereo => {
                PropertyValue::UIntList(device.preferred_stereo.clone())
            }
            Selector::StreamConfiguration => PropertyValue::UInt(match address.scope {
                Scope::Input => device.profile.input_channels,
                _ => device.profile.output_channels,
            }),
            _ => return Err(AudioError::PropertyNotFound),
        })
    }

    fn set(
        &self,
        object: ObjectId,
        address: PropertyAddress,
        value: &PropertyValue,
    ) -> Result<(), AudioError> {
        if !self.is_settable(object, address) {
            let state = self.state.lock();
            return Err(if Self::has_property_locked(&state, object, address) {
                AudioError::PropertyNotSettable
            } else {
                Self::missing(&state, object)
            });
        }

        let changed = {
            let mut state = self.state.lock();
            if object == SYSTEM_OBJECT {
                if address.selector == Selector::DefaultOutputDevice {
                    if let Some(status) = state.default_output_failure.take() {
                        return Err(AudioError::OsStatus {
                            status,
                            context: "set default device",
                        });
                    }
                }
                let target = value.as_u32().ok_or(AudioError::TypeMismatch)?;
                let valid = state
                    .devices
                    .get(&target)
                    .map(|d| d.profile.output_channels > 0 || address.selector == Selector::DefaultInputDevice)
                    .unwrap_or(false);
                if !valid {
                    return Err(AudioError::OsStatus {
                        status: BAD_DEVICE_ERROR,
                        context: "set default device",
                    });
                }
                let slot = match address.selector {
                    Selector::DefaultOutputDevice => &mut state.default_output,
                    Selector::DefaultSystemOutputDevice => &mut state.default_system_output,
                    _ => &mut state.default_input,
                };
                let changed = *slot != target;
                *slot = target;
                changed
            } else {
                let device = state
                    .devices
                    .get_mut(&object)
                    .ok_or(AudioError::EndpointNotFound { object })?;
                match address.selector {
                    Selector::VolumeScalar => {
                        let level = value.as_f32().ok_or(AudioError::TypeMismatch)?;
                        let slot = device
                            .volumes
                            .get_mut(&address.element)
                            .ok_or(AudioError::PropertyNotFound)?;
                        let changed = *slot != level;
                        *slot = level;
                        changed
                    }
                    Selector::Mute => {
                        let muted = value.as_u32().ok_or(AudioError::TypeMismatch)? != 0;
                        let changed = device.muted != muted;
                        device.muted = muted;
                        changed
                    }
                    Selector::PreferredChannelsForStereo => {
                        let channels = value.clone().into_list().ok_or(AudioError::TypeMismatch)?;
                        if channels.len() != 2 {
                            return Err(AudioError::TypeMismatch);
                        }
                        device.preferred_stereo = channels;
                        true
                    }
                    _ => return Err(AudioError::PropertyNotSettable),
                }
            }
        };

        if changed {
            self.notify(object, &[address]);
        }
        Ok(())
    }

    fn add_listener(
        &self,
        object: ObjectId,
        address: PropertyAddress,
        sink: ListenerSink,
    ) -> Result<ListenerToken, AudioError> {
        let mut state = self.state.lock();
        if object != SYSTEM_OBJECT && !state.devices.contains_key(&object) {
            return Err(AudioError::EndpointNotFound { object });
        }
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(
            id,
            Listener {
                object,
                address,
                sink,
            },
        );
        Ok(ListenerToken {
            object,
            address,
            id,
        })
    }

    fn remove_listener(&self, token: ListenerToken) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if token.object != SYSTEM_OBJECT && !state.devices.contains_key(&token.object) {
            state.stale_removals += 1;
            return Err(AudioError::EndpointNotFound {
                object: token.object,
            });
        }
        state.listeners.remove(&token.id);
        Ok(())
    }

    fn discard_listener(&self, token: ListenerToken) {
        self.state.lock().listeners.remove(&token.id);
    }

    fn create_aggregate(&self, description: &AggregateDescription) -> Result<ObjectId, AudioError> {
        let id = {
            let mut state = self.state.lock();
            if let Some(status) = state.create_failure.take() {
                return Err(AudioError::CreationFailed(status));
            }

            let member_channels: u32 = description
                .sub_devices
                .iter()
                .filter_map(|sub| state.devices.values().find(|d| d.profile.uid == sub.uid))
                .map(|d| d.profile.output_channels)
                .sum();
            let output_channels = if description.is_stacked {
                member_channels
            } else {
                2
            };

            let profile = SimulatedDevice {
                uid: description.uid.clone(),
                name: description.name.clone(),
                manufacturer: "Apple Inc.".to_string(),
                transport_type: TRANSPORT_TYPE_AGGREGATE,
                input_channels: 0,
                output_channels,
                volume_channels: Vec::new(),
                volume_settable: false,
                has_mute: false,
                initial_volume: 1.0,
            };
            let id = state.next_object;
            state.next_object += 1;
            let mut device = DeviceState::new(profile);
            device.aggregate = Some(description.clone());
            state.devices.insert(id, device);
            id
        };
        self.notify(SYSTEM_OBJECT, &[PropertyAddress::global(Selector::Devices)]);
        Ok(id)
    }

    fn destroy_aggregate(&self, object: ObjectId) -> Result<(), AudioError> {
        let default_changed = {
            let mut state = self.state.lock();
            match state.devices.get(&object) {
                None => return Err(AudioError::EndpointNotFound { object }),
                Some(d) if d.aggregate.is_none() => {
                    return Err(AudioError::OsStatus {
                        status: BAD_DEVICE_ERROR,
                        context: "destroy aggregate",
                    })
                }
                Some(_) => {}
            }
            state.devices.remove(&object);
            Self::repair_defaults(&mut state, object)
        };
        let mut changed = vec![PropertyAddress::global(Selector::Devices)];
        if default_changed {
            changed.push(PropertyAddress::global(Selector::DefaultOutputDevice));
        }
        self.notify(SYSTEM_OBJECT, &changed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::property::SubDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn description(uid: &str) -> AggregateDescription {
        AggregateDescription {
            name: "Test".to_string(),
            uid: uid.to_string(),
            sub_devices: vec![
                SubDevice {
                    uid: "a".to_string(),
                    drift_compensation: false,
                },
                SubDevice {
                    uid: "b".to_string(),
                    drift_compensation: true,
                },
            ],
            master_uid: "a".to_string(),
            is_private: false,
            is_stacked: true,
        }
    }

    #[test]
    fn test_listener_fires_only_on_change() {
        let backend = SimulatedBackend::new();
        let id = backend.add_device(SimulatedDevice::output("a", "A"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sink: ListenerSink = Arc::new(move |_: ObjectId, _: &[PropertyAddress]| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        backend
            .add_listener(id, PropertyAddress::output_volume(0), sink)
            .unwrap();

        let value = PropertyValue::Float(0.8);
        backend.set(id, PropertyAddress::output_volume(0), &value).unwrap();
        backend.set(id, PropertyAddress::output_volume(0), &value).unwrap();
        backend
            .set(id, PropertyAddress::output_volume(1), &PropertyValue::Float(0.1))
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stacked_aggregate_concatenates_channels() {
        let backend = SimulatedBackend::new();
        backend.add_device(SimulatedDevice::output("a", "A"));
        backend.add_device(SimulatedDevice::output("b", "B"));

        let id = backend.create_aggregate(&description("agg")).unwrap();
        let channels = backend
            .get(id, PropertyAddress::output(Selector::StreamConfiguration))
            .unwrap();
        assert_eq!(channels, PropertyValue::UInt(4));
    }

    #[test]
    fn test_destroying_default_falls_back_to_physical_output() {
        let backend = SimulatedBackend::new();
        backend.add_device(SimulatedDevice::output("a", "A"));
        backend.add_device(SimulatedDevice::output("b", "B"));
        let agg = backend.create_aggregate(&description("agg")).unwrap();
        backend
            .set(
                SYSTEM_OBJECT,
                PropertyAddress::global(Selector::DefaultOutputDevice),
                &PropertyValue::UInt(agg),
            )
            .unwrap();

        backend.destroy_aggregate(agg).unwrap();
        assert_eq!(backend.default_output_uid().as_deref(), Some("a"));
        assert_eq!(
            backend.destroy_aggregate(agg),
            Err(AudioError::EndpointNotFound { object: agg })
        );
    }

    #[test]
    fn test_create_failure_is_one_shot() {
        let backend = SimulatedBackend::new();
        backend.fail_next_create(-50);
        assert_eq!(
            backend.create_aggregate(&description("x")),
            Err(AudioError::CreationFailed(-50))
        );
        assert!(backend.create_aggregate(&description("x")).is_ok());
    }

    #[test]
    fn test_remove_listener_on_gone_device_is_counted() {
        let backend = SimulatedBackend::new();
        let id = backend.add_device(SimulatedDevice::output("a", "A"));
        let token = backend
            .add_listener(
                id,
                PropertyAddress::output_mute(),
                Arc::new(|_: ObjectId, _: &[PropertyAddress]| {}),
            )
            .unwrap();
        backend.disconnect("a");

        assert!(backend.remove_listener(token).is_err());
        assert_eq!(backend.stale_removals(), 1);
    }
}
