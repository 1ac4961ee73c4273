//! [`AudioBackend`] over the CoreAudio HAL.

use crate::audio::device::AudioError;
use crate::audio::property::{
    AggregateDescription, AudioBackend, ListenerSink, ListenerToken, ObjectId, PropertyAddress,
    PropertyValue, Scope, Selector,
};
use core_foundation::array::CFArray;
use core_foundation::base::{CFType, TCFType};
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::{CFString, CFStringRef};
use coreaudio_sys::{
    AudioBufferList, AudioHardwareCreateAggregateDevice, AudioHardwareDestroyAggregateDevice,
    AudioObjectAddPropertyListener, AudioObjectGetPropertyData, AudioObjectGetPropertyDataSize,
    AudioObjectHasProperty, AudioObjectID, AudioObjectIsPropertySettable, AudioObjectPropertyAddress,
    AudioObjectRemovePropertyListener, OSStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

const ERR_BAD_OBJECT: OSStatus = fourcc(b"!obj") as OSStatus;
const ERR_BAD_DEVICE: OSStatus = fourcc(b"!dev") as OSStatus;
const ERR_UNKNOWN_PROPERTY: OSStatus = fourcc(b"who?") as OSStatus;
const ERR_ILLEGAL_OPERATION: OSStatus = fourcc(b"nope") as OSStatus;
const ERR_UNSUPPORTED_OPERATION: OSStatus = fourcc(b"unop") as OSStatus;

// Aggregate description dictionary keys
const KEY_NAME: &str = "name";
const KEY_UID: &str = "uid";
const KEY_SUBDEVICES: &str = "subdevices";
const KEY_MASTER: &str = "master";
const KEY_PRIVATE: &str = "private";
const KEY_STACKED: &str = "stacked";
const KEY_SUBDEVICE_UID: &str = "uid";
const KEY_SUBDEVICE_DRIFT: &str = "drift";

fn selector_code(selector: Selector) -> u32 {
    match selector {
        Selector::DeviceUid => fourcc(b"uid "),
        Selector::Name => fourcc(b"lnam"),
        Selector::Manufacturer => fourcc(b"lmak"),
        Selector::TransportType => fourcc(b"tran"),
        Selector::VolumeScalar => fourcc(b"volm"),
        Selector::Mute => fourcc(b"mute"),
        Selector::PreferredChannelsForStereo => fourcc(b"dch2"),
        Selector::StreamConfiguration => fourcc(b"slay"),
        Selector::Devices => fourcc(b"dev#"),
        Selector::DefaultOutputDevice => fourcc(b"dOut"),
        Selector::DefaultSystemOutputDevice => fourcc(b"sOut"),
        Selector::DefaultInputDevice => fourcc(b"dIn "),
    }
}

fn scope_code(scope: Scope) -> u32 {
    match scope {
        Scope::Global => fourcc(b"glob"),
        Scope::Output => fourcc(b"outp"),
        Scope::Input => fourcc(b"inpt"),
    }
}

fn raw_address(address: PropertyAddress) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector_code(address.selector),
        mScope: scope_code(address.scope),
        mElement: address.element,
    }
}

fn check(status: OSStatus, object: ObjectId, context: &'static str) -> Result<(), AudioError> {
    match status {
        0 => Ok(()),
        ERR_BAD_OBJECT | ERR_BAD_DEVICE => Err(AudioError::EndpointNotFound { object }),
        ERR_UNKNOWN_PROPERTY => Err(AudioError::PropertyNotFound),
        ERR_ILLEGAL_OPERATION | ERR_UNSUPPORTED_OPERATION => Err(AudioError::PropertyNotSettable),
        status => Err(AudioError::OsStatus { status, context }),
    }
}

/// Listener state handed to CoreAudio as client data.
struct ListenerContext {
    sink: ListenerSink,
    address: PropertyAddress,
}

struct Registration {
    object: ObjectId,
    address: PropertyAddress,
    context: Arc<ListenerContext>,
}

impl Registration {
    fn client_data(&self) -> *mut c_void {
        Arc::as_ptr(&self.context) as *mut c_void
    }
}

/// How long a removed listener's context stays allocated.
///
/// A callback already running on the HAL notification thread may still read
/// it after removal returns.
const LISTENER_GRACE: Duration = Duration::from_secs(2);

/// Contexts of removed listeners, freed once [`LISTENER_GRACE`] has passed.
struct Retired<T> {
    entries: Vec<(Instant, T)>,
}

impl<T> Retired<T> {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn retire(&mut self, item: T, now: Instant) {
        self.purge(now);
        self.entries.push((now, item));
    }

    fn purge(&mut self, now: Instant) {
        self.entries
            .retain(|(at, _)| now.saturating_duration_since(*at) < LISTENER_GRACE);
    }

    /// Hand every entry still inside its grace period to `keep`.
    fn drain_young(&mut self, now: Instant, mut keep: impl FnMut(T)) {
        for (at, item) in self.entries.drain(..) {
            if now.saturating_duration_since(at) < LISTENER_GRACE {
                keep(item);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

unsafe extern "C" fn listener_proc(
    object: AudioObjectID,
    _count: u32,
    _addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus {
    // SAFETY: client_data points into an Arc kept alive past removal
    let context = &*(client_data as *const ListenerContext);
    (context.sink)(object, std::slice::from_ref(&context.address));
    0
}

pub struct CoreAudioBackend {
    listeners: Mutex<HashMap<u64, Registration>>,
    retired: Mutex<Retired<Arc<ListenerContext>>>,
    next_id: AtomicU64,
}

impl CoreAudioBackend {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            retired: Mutex::new(Retired::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn data_size(&self, object: ObjectId, address: &AudioObjectPropertyAddress) -> Result<u32, AudioError> {
        let mut size = 0u32;
        // SAFETY: address and size are valid for the call
        let status = unsafe { AudioObjectGetPropertyDataSize(object, address, 0, ptr::null(), &mut size) };
        check(status, object, "AudioObjectGetPropertyDataSize")?;
        Ok(size)
    }

    /// # Safety
    /// `T` must match the property's data layout.
    unsafe fn read<T: Copy>(&self, object: ObjectId, address: &AudioObjectPropertyAddress, init: T) -> Result<T, AudioError> {
        let mut value = init;
        let mut size = mem::size_of::<T>() as u32;
        let status = AudioObjectGetPropertyData(
            object,
            address,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        );
        check(status, object, "AudioObjectGetPropertyData")?;
        Ok(value)
    }

    fn read_u32_list(&self, object: ObjectId, address: &AudioObjectPropertyAddress) -> Result<Vec<u32>, AudioError> {
        let mut size = self.data_size(object, address)?;
        let mut values = vec![0u32; size as usize / mem::size_of::<u32>()];
        // SAFETY: the buffer holds `size` bytes
        let status = unsafe {
            AudioObjectGetPropertyData(
                object,
                address,
                0,
                ptr::null(),
                &mut size,
                values.as_mut_ptr() as *mut c_void,
            )
        };
        check(status, object, "AudioObjectGetPropertyData")?;
        values.truncate(size as usize / mem::size_of::<u32>());
        Ok(values)
    }

    fn read_string(&self, object: ObjectId, address: &AudioObjectPropertyAddress) -> Result<String, AudioError> {
        // SAFETY: string properties return a +1 CFStringRef
        let string: CFStringRef = unsafe { self.read(object, address, ptr::null())? };
        if string.is_null() {
            return Err(AudioError::TypeMismatch);
        }
        // SAFETY: non-null and owned by us under the create rule
        let string = unsafe { CFString::wrap_under_create_rule(string) };
        Ok(string.to_string())
    }

    fn retire(&self, context: Arc<ListenerContext>) {
        self.retired.lock().retire(context, Instant::now());
    }

    /// Total channels across every buffer of the stream configuration.
    fn read_channel_count(&self, object: ObjectId, address: &AudioObjectPropertyAddress) -> Result<u32, AudioError> {
        let mut size = self.data_size(object, address)?;
        if (size as usize) < mem::size_of::<u32>() {
            return Ok(0);
        }
        // u64 backing keeps the buffer list aligned
        let mut storage = vec![0u64; (size as usize).div_ceil(mem::size_of::<u64>())];
        // SAFETY: storage holds at least `size` bytes
        let status = unsafe {
            AudioObjectGetPropertyData(
                object,
                address,
                0,
                ptr::null(),
                &mut size,
                storage.as_mut_ptr() as *mut c_void,
            )
        };
        check(status, object, "AudioObjectGetPropertyData")?;

        // SAFETY: the HAL filled an AudioBufferList with mNumberBuffers entries
        let total = unsafe {
            let list = &*(storage.as_ptr() as *const AudioBufferList);
            let buffers = std::slice::from_raw_parts(list.mBuffers.as_ptr(), list.mNumberBuffers as usize);
            buffers.iter().map(|buffer| buffer.mNumberChannels).sum()
        };
        Ok(total)
    }

    fn write<T>(&self, object: ObjectId, address: &AudioObjectPropertyAddress, data: *const T, size: usize) -> Result<(), AudioError> {
        // SAFETY: data points to `size` readable bytes
        let status = unsafe {
            coreaudio_sys::AudioObjectSetPropertyData(object, address, 0, ptr::null(), size as u32, data as *const c_void)
        };
        check(status, object, "AudioObjectSetPropertyData")
    }
}

impl Default for CoreAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CoreAudioBackend {
    fn has_property(&self, object: ObjectId, address: PropertyAddress) -> bool {
        let raw = raw_address(address);
        // SAFETY: raw is a valid address for the call
        unsafe { AudioObjectHasProperty(object, &raw) != 0 }
    }

    fn is_settable(&self, object: ObjectId, address: PropertyAddress) -> bool {
        let raw = raw_address(address);
        let mut settable = 0;
        // SAFETY: raw and settable are valid for the call
        let status = unsafe { AudioObjectIsPropertySettable(object, &raw, &mut settable) };
        status == 0 && settable != 0
    }

    fn get(&self, object: ObjectId, address: PropertyAddress) -> Result<PropertyValue, AudioError> {
        let raw = raw_address(address);
        match address.selector {
            Selector::DeviceUid | Selector::Name | Selector::Manufacturer => {
                self.read_string(object, &raw).map(PropertyValue::Text)
            }
            // SAFETY: Float32 property
            Selector::VolumeScalar => unsafe { self.read(object, &raw, 0f32) }.map(PropertyValue::Float),
            Selector::PreferredChannelsForStereo | Selector::Devices => {
                self.read_u32_list(object, &raw).map(PropertyValue::UIntList)
            }
            Selector::StreamConfiguration => self.read_channel_count(object, &raw).map(PropertyValue::UInt),
            Selector::TransportType
            | Selector::Mute
            | Selector::DefaultOutputDevice
            | Selector::DefaultSystemOutputDevice
            | Selector::DefaultInputDevice => {
                // SAFETY: UInt32 / AudioObjectID property
                unsafe { self.read(object, &raw, 0u32) }.map(PropertyValue::UInt)
            }
        }
    }

    fn set(&self, object: ObjectId, address: PropertyAddress, value: &PropertyValue) -> Result<(), AudioError> {
        let raw = raw_address(address);
        match value {
            PropertyValue::Float(v) => self.write(object, &raw, v as *const f32, mem::size_of::<f32>()),
            PropertyValue::UInt(v) => self.write(object, &raw, v as *const u32, mem::size_of::<u32>()),
            PropertyValue::UIntList(values) => {
                self.write(object, &raw, values.as_ptr(), mem::size_of_val(values.as_slice()))
            }
            PropertyValue::Text(_) => Err(AudioError::TypeMismatch),
        }
    }

    fn add_listener(&self, object: ObjectId, address: PropertyAddress, sink: ListenerSink) -> Result<ListenerToken, AudioError> {
        let raw = raw_address(address);
        let registration = Registration {
            object,
            address,
            context: Arc::new(ListenerContext { sink, address }),
        };
        // SAFETY: the context outlives the registration by at least LISTENER_GRACE
        let status = unsafe {
            AudioObjectAddPropertyListener(object, &raw, Some(listener_proc), registration.client_data())
        };
        check(status, object, "AudioObjectAddPropertyListener")?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, registration);
        Ok(ListenerToken { object, address, id })
    }

    fn remove_listener(&self, token: ListenerToken) -> Result<(), AudioError> {
        let Some(registration) = self.listeners.lock().remove(&token.id) else {
            return Ok(());
        };
        let raw = raw_address(registration.address);
        // SAFETY: same proc and client data as registered
        let status = unsafe {
            AudioObjectRemovePropertyListener(
                registration.object,
                &raw,
                Some(listener_proc),
                registration.client_data(),
            )
        };
        match check(status, registration.object, "AudioObjectRemovePropertyListener") {
            Ok(()) | Err(AudioError::EndpointNotFound { .. }) => {
                self.retire(registration.context);
                Ok(())
            }
            Err(e) => {
                // still registered, so the context must never be freed
                warn!(object = registration.object, error = %e, "listener removal failed");
                mem::forget(registration.context);
                Err(e)
            }
        }
    }

    fn discard_listener(&self, token: ListenerToken) {
        if let Some(registration) = self.listeners.lock().remove(&token.id) {
            debug!(object = registration.object, "discarding listener of vanished object");
            self.retire(registration.context);
        }
    }

    fn create_aggregate(&self, description: &AggregateDescription) -> Result<ObjectId, AudioError> {
        let dictionary = aggregate_dictionary(description);
        let mut id: AudioObjectID = 0;
        // SAFETY: dictionary is a valid CFDictionary for the call
        let status =
            unsafe { AudioHardwareCreateAggregateDevice(dictionary.as_concrete_TypeRef() as _, &mut id) };
        if status != 0 {
            return Err(AudioError::CreationFailed(status));
        }
        Ok(id)
    }

    fn destroy_aggregate(&self, object: ObjectId) -> Result<(), AudioError> {
        // SAFETY: plain call by id
        let status = unsafe { AudioHardwareDestroyAggregateDevice(object) };
        check(status, object, "AudioHardwareDestroyAggregateDevice")
    }
}

impl Drop for CoreAudioBackend {
    fn drop(&mut self) {
        let ids: Vec<u64> = self.listeners.lock().keys().copied().collect();
        for id in ids {
            let token = {
                let listeners = self.listeners.lock();
                listeners.get(&id).map(|r| ListenerToken {
                    object: r.object,
                    address: r.address,
                    id,
                })
            };
            if let Some(token) = token {
                let _ = self.remove_listener(token);
            }
        }
        // contexts removed moments ago may still be read by a late callback
        self.retired.lock().drain_young(Instant::now(), mem::forget);
    }
}

fn cf_flag(flag: bool) -> CFType {
    CFNumber::from(i32::from(flag)).as_CFType()
}

fn aggregate_dictionary(description: &AggregateDescription) -> CFDictionary<CFString, CFType> {
    let sub_devices: Vec<CFDictionary<CFString, CFType>> = description
        .sub_devices
        .iter()
        .map(|sub| {
            CFDictionary::from_CFType_pairs(&[
                (CFString::from_static_string(KEY_SUBDEVICE_UID), CFString::new(&sub.uid).as_CFType()),
                (CFString::from_static_string(KEY_SUBDEVICE_DRIFT), cf_flag(sub.drift_compensation)),
            ])
        })
        .collect();

    CFDictionary::from_CFType_pairs(&[
        (CFString::from_static_string(KEY_NAME), CFString::new(&description.name).as_CFType()),
        (CFString::from_static_string(KEY_UID), CFString::new(&description.uid).as_CFType()),
        (CFString::from_static_string(KEY_SUBDEVICES), CFArray::from_CFTypes(&sub_devices).as_CFType()),
        (CFString::from_static_string(KEY_MASTER), CFString::new(&description.master_uid).as_CFType()),
        (CFString::from_static_string(KEY_PRIVATE), cf_flag(description.is_private)),
        (CFString::from_static_string(KEY_STACKED), cf_flag(description.is_stacked)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::property::SubDevice;

    #[test]
    fn test_retired_contexts_outlive_grace_period() {
        let start = Instant::now();
        let mut retired = Retired::new();
        retired.retire(Arc::new(1), start);
        retired.retire(Arc::new(2), start + Duration::from_millis(500));
        assert_eq!(retired.len(), 2);

        retired.purge(start + LISTENER_GRACE);
        assert_eq!(retired.len(), 1);
        retired.purge(start + LISTENER_GRACE * 2);
        assert_eq!(retired.len(), 0);
    }

    #[test]
    fn test_young_contexts_are_kept_on_drain() {
        let start = Instant::now();
        let context = Arc::new(7);
        let mut retired = Retired::new();
        retired.retire(Arc::new(1), start);
        retired.retire(context.clone(), start + LISTENER_GRACE);

        let mut kept = Vec::new();
        retired.drain_young(start + LISTENER_GRACE + Duration::from_millis(1), |c| kept.push(c));
        assert_eq!(retired.len(), 0);
        assert_eq!(kept.len(), 1);
        assert_eq!(Arc::strong_count(&context), 2);
    }

    #[test]
    fn test_aggregate_dictionary_carries_every_key() {
        let description = AggregateDescription {
            name: "Merged".to_string(),
            uid: "com.volumemaster.multioutput.TEST".to_string(),
            sub_devices: vec![SubDevice {
                uid: "left".to_string(),
                drift_compensation: false,
            }],
            master_uid: "left".to_string(),
            is_private: false,
            is_stacked: true,
        };
        let dictionary = aggregate_dictionary(&description);
        assert_eq!(dictionary.len(), 6);
        let uid = dictionary.find(&CFString::from_static_string(KEY_UID)).unwrap();
        assert_eq!(uid.downcast::<CFString>().unwrap().to_string(), description.uid);
    }
}
