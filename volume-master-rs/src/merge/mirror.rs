//! Primary to secondary volume mirroring.

use crate::audio::notifications::property_change_sink;
use crate::audio::property::{AudioBackend, ListenerToken, ObjectId, PropertyAddress, Selector};
use crate::audio::volume::{VolumeController, MONITORED_CHANNELS};
use crate::events::EngineEvent;
use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

/// Replays volume and mute changes of the primary endpoint onto the secondary.
#[derive(Default)]
pub struct MirrorEngine {
    bound: Option<(ObjectId, ObjectId)>,
    tokens: Vec<ListenerToken>,
}

impl MirrorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.bound.is_some()
    }

    /// Number of listeners currently registered on the primary.
    pub fn subscriptions(&self) -> usize {
        self.tokens.len()
    }

    /// Observe every monitored volume channel and the mute control the
    /// primary actually exposes.
    pub fn start(
        &mut self,
        backend: &dyn AudioBackend,
        primary: ObjectId,
        secondary: ObjectId,
        sender: &Sender<EngineEvent>,
    ) {
        self.stop(backend);
        self.bound = Some((primary, secondary));

        let addresses = MONITORED_CHANNELS
            .iter()
            .map(|&ch| PropertyAddress::output_volume(ch))
            .chain(std::iter::once(PropertyAddress::output_mute()));

        for address in addresses {
            if !backend.has_property(primary, address) {
                continue;
            }
            match backend.add_listener(primary, address, property_change_sink(sender.clone())) {
                Ok(token) => self.tokens.push(token),
                Err(e) => warn!(primary, %address, error = %e, "failed to observe property"),
            }
        }
        debug!(primary, secondary, listeners = self.tokens.len(), "volume mirroring started");
    }

    /// Remove the listeners.
    ///
    /// On a primary that has disconnected only the bookkeeping is dropped.
    pub fn stop(&mut self, backend: &dyn AudioBackend) {
        let Some((primary, _)) = self.bound.take() else {
            return;
        };
        let alive = VolumeController::new(backend, primary).is_alive();
        for token in self.tokens.drain(..) {
            if alive {
                if let Err(e) = backend.remove_listener(token) {
                    debug!(primary, error = %e, "listener removal failed");
                }
            } else {
                backend.discard_listener(token);
            }
        }
        debug!(primary, alive, "volume mirroring stopped");
    }

    /// Apply a batch of change notifications from the primary.
    pub fn handle_change(&self, backend: &dyn AudioBackend, object: ObjectId, addresses: &[PropertyAddress]) {
        let Some((primary, _)) = self.bound else {
            return;
        };
        if object != primary {
            return;
        }
        let mut mute_changed = false;
        for address in addresses {
            match address.selector {
                Selector::VolumeScalar => self.mirror_volume(backend, address.element),
                Selector::Mute => mute_changed = true,
                _ => {}
            }
        }
        if mute_changed {
            self.mirror_mute(backend);
        }
    }

    /// Copy one channel's volume from the primary to the secondary.
    pub fn mirror_volume(&self, backend: &dyn AudioBackend, channel: u32) {
        let Some((primary, secondary)) = self.bound else {
            return;
        };
        if let Some(level) = VolumeController::new(backend, primary).volume(channel) {
            trace!(channel, level, "mirroring volume");
            VolumeController::new(backend, secondary).set_volume(channel, level);
        }
    }

    pub fn mirror_mute(&self, backend: &dyn AudioBackend) {
        let Some((primary, secondary)) = self.bound else {
            return;
        };
        if let Some(muted) = VolumeController::new(backend, primary).mute() {
            VolumeController::new(backend, secondary).set_mute(muted);
        }
    }

    /// Bring the secondary in line with the primary right away.
    pub fn sync_now(&self, backend: &dyn AudioBackend) {
        for channel in MONITORED_CHANNELS {
            self.mirror_volume(backend, channel);
        }
        self.mirror_mute(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedBackend, SimulatedDevice};
    use crate::events::create_event_channel;
    use crossbeam_channel::Receiver;

    fn drain(mirror: &MirrorEngine, backend: &SimulatedBackend, rx: &Receiver<EngineEvent>) {
        for event in rx.try_iter() {
            if let EngineEvent::PropertiesChanged { object, addresses } = event {
                mirror.handle_change(backend, object, &addresses);
            }
        }
    }

    #[test]
    fn test_volume_and_mute_follow_primary() {
        let backend = SimulatedBackend::new();
        let primary = backend.add_device(SimulatedDevice::output("a", "A"));
        let secondary = backend.add_device(SimulatedDevice::output("b", "B").with_volume(0.9));
        let (tx, rx) = create_event_channel();

        let mut mirror = MirrorEngine::new();
        mirror.start(&backend, primary, secondary, &tx);
        assert_eq!(mirror.subscriptions(), 4);
        mirror.sync_now(&backend);
        assert_eq!(VolumeController::new(&backend, secondary).volume(0), Some(0.5));

        let p = VolumeController::new(&backend, primary);
        p.set_volume(1, 0.25);
        p.set_mute(true);
        drain(&mirror, &backend, &rx);

        let s = VolumeController::new(&backend, secondary);
        assert_eq!(s.volume(1), Some(0.25));
        assert_eq!(s.mute(), Some(true));

        mirror.stop(&backend);
        assert_eq!(backend.listener_count(primary), 0);
    }

    #[test]
    fn test_only_exposed_channels_are_observed() {
        let backend = SimulatedBackend::new();
        let primary = backend.add_device(SimulatedDevice::output("a", "A").master_only());
        let secondary = backend.add_device(SimulatedDevice::output("b", "B"));
        let (tx, _rx) = create_event_channel();

        let mut mirror = MirrorEngine::new();
        mirror.start(&backend, primary, secondary, &tx);
        // master volume and mute
        assert_eq!(mirror.subscriptions(), 2);
    }

    #[test]
    fn test_stop_after_primary_disconnect_skips_removal() {
        let backend = SimulatedBackend::new();
        let primary = backend.add_device(SimulatedDevice::output("a", "A"));
        let secondary = backend.add_device(SimulatedDevice::output("b", "B"));
        let (tx, _rx) = create_event_channel();

        let mut mirror = MirrorEngine::new();
        mirror.start(&backend, primary, secondary, &tx);
        backend.disconnect("a");
        mirror.stop(&backend);

        assert_eq!(backend.stale_removals(), 0);
        assert_eq!(backend.listener_count(primary), 0);
        assert!(!mirror.is_active());
    }
}
