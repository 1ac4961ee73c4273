//! Device list monitoring.
//!
//! Keeps a snapshot of present device UIDs and turns each device list
//! notification into a connected/disconnected diff.

use super::device::{AudioError, DeviceEvent};
use super::enumerator::DeviceEnumerator;
use super::notifications::device_list_sink;
use super::property::{ListenerToken, PropertyAddress, Selector, SYSTEM_OBJECT};
use crate::events::EngineEvent;
use crossbeam_channel::Sender;
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Default)]
pub struct DeviceMonitor {
    known: BTreeSet<String>,
    token: Option<ListenerToken>,
}

impl DeviceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_listening(&self) -> bool {
        self.token.is_some()
    }

    /// Snapshot the current devices and start listening for list changes.
    pub fn start(
        &mut self,
        enumerator: &DeviceEnumerator,
        sender: Sender<EngineEvent>,
    ) -> Result<(), AudioError> {
        if self.token.is_some() {
            return Ok(());
        }
        self.known = enumerator.device_uids();
        let token = enumerator.backend().add_listener(
            SYSTEM_OBJECT,
            PropertyAddress::global(Selector::Devices),
            device_list_sink(sender),
        )?;
        self.token = Some(token);
        debug!(devices = self.known.len(), "device monitor started");
        Ok(())
    }

    pub fn stop(&mut self, enumerator: &DeviceEnumerator) {
        if let Some(token) = self.token.take() {
            if let Err(e) = enumerator.backend().remove_listener(token) {
                warn!(error = %e, "failed to remove device list listener");
            }
        }
    }

    /// Re-enumerate and diff against the last snapshot.
    ///
    /// Returns `None` when nothing was connected or disconnected.
    pub fn refresh(&mut self, enumerator: &DeviceEnumerator) -> Option<DeviceEvent> {
        let current = enumerator.device_uids();
        let connected: BTreeSet<String> = current.difference(&self.known).cloned().collect();
        let disconnected: BTreeSet<String> = self.known.difference(&current).cloned().collect();
        self.known = current;

        if connected.is_empty() && disconnected.is_empty() {
            return None;
        }
        Some(DeviceEvent::DevicesChanged {
            connected,
            disconnected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedBackend, SimulatedDevice};
    use crate::events::create_event_channel;
    use std::sync::Arc;

    #[test]
    fn test_diff_reports_connect_and_disconnect() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.add_device(SimulatedDevice::output("a", "A"));
        backend.add_device(SimulatedDevice::output("b", "B"));
        let enumerator = DeviceEnumerator::new(backend.clone());
        let (tx, rx) = create_event_channel();

        let mut monitor = DeviceMonitor::new();
        monitor.start(&enumerator, tx).unwrap();
        assert!(monitor.is_listening());

        backend.disconnect("a");
        backend.add_device(SimulatedDevice::output("c", "C"));
        assert_eq!(rx.try_iter().count(), 2);

        let event = monitor.refresh(&enumerator).unwrap();
        assert_eq!(
            event,
            DeviceEvent::DevicesChanged {
                connected: BTreeSet::from(["c".to_string()]),
                disconnected: BTreeSet::from(["a".to_string()]),
            }
        );
        assert_eq!(monitor.refresh(&enumerator), None);

        monitor.stop(&enumerator);
        assert_eq!(backend.listener_count(SYSTEM_OBJECT), 0);
    }
}
