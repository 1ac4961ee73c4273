use super::device::AudioError;
use super::property::{AudioBackend, ObjectId, PropertyAddress, PropertyValue, Selector, SYSTEM_OBJECT};
use tracing::debug;

/// Sets the specified device as the default output, and as the system
/// (alert sound) output when that property can be changed.
pub fn set_default_output_device(backend: &dyn AudioBackend, device: ObjectId) -> Result<(), AudioError> {
    backend.set(
        SYSTEM_OBJECT,
        PropertyAddress::global(Selector::DefaultOutputDevice),
        &PropertyValue::UInt(device),
    )?;
    set_system_output_if_settable(backend, device);
    Ok(())
}

fn set_system_output_if_settable(backend: &dyn AudioBackend, device: ObjectId) {
    let address = PropertyAddress::global(Selector::DefaultSystemOutputDevice);
    if !backend.is_settable(SYSTEM_OBJECT, address) {
        return;
    }
    if let Err(e) = backend.set(SYSTEM_OBJECT, address, &PropertyValue::UInt(device)) {
        debug!(device, error = %e, "could not move system output");
    }
}
