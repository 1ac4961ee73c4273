//! Property-change notification sinks.
//!
//! CoreAudio invokes listeners on its own notification thread. These sinks
//! only copy the changed addresses into an [`EngineEvent`] and queue it for
//! the coordinator.

use super::property::{ListenerSink, ObjectId, PropertyAddress, Selector};
use crate::events::EngineEvent;
use crossbeam_channel::Sender;
use std::sync::Arc;

/// Sink forwarding property changes of a single device.
pub fn property_change_sink(sender: Sender<EngineEvent>) -> ListenerSink {
    Arc::new(move |object: ObjectId, addresses: &[PropertyAddress]| {
        let _ = sender.send(EngineEvent::PropertiesChanged {
            object,
            addresses: addresses.to_vec(),
        });
    })
}

/// Sink forwarding device list changes of the system object.
pub fn device_list_sink(sender: Sender<EngineEvent>) -> ListenerSink {
    Arc::new(move |_: ObjectId, addresses: &[PropertyAddress]| {
        if addresses.iter().any(|a| a.selector == Selector::Devices) {
            let _ = sender.send(EngineEvent::DeviceListChanged);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_channel;

    #[test]
    fn test_property_sink_copies_addresses() {
        let (tx, rx) = create_event_channel();
        let sink = property_change_sink(tx);
        sink(42, &[PropertyAddress::output_volume(1), PropertyAddress::output_mute()]);

        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::PropertiesChanged {
                object: 42,
                addresses: vec![PropertyAddress::output_volume(1), PropertyAddress::output_mute()],
            }
        );
    }

    #[test]
    fn test_device_list_sink_ignores_default_changes() {
        let (tx, rx) = create_event_channel();
        let sink = device_list_sink(tx);
        sink(1, &[PropertyAddress::global(Selector::DefaultOutputDevice)]);
        assert!(rx.try_recv().is_err());

        sink(1, &[PropertyAddress::global(Selector::Devices)]);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::DeviceListChanged);
    }
}
