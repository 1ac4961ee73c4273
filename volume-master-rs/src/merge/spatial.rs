//! Window-driven left/right balance.
//!
//! The primary endpoint plays the left side, the secondary the right. While
//! active, the focused window's horizontal position sets a gain per side,
//! applied on top of a shared base volume.

use crate::audio::property::{AudioBackend, ObjectId};
use crate::audio::volume::VolumeController;
use crate::events::EngineEvent;
use crate::window::WindowTracker;
use crossbeam_channel::Sender;
use tracing::{debug, info};

/// Lowest gain either side is attenuated to.
pub const GAIN_FLOOR: f32 = 0.15;

/// Base volume used when the primary has no readable master volume.
const DEFAULT_BASE_VOLUME: f32 = 0.5;

/// Per-side gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub left_gain: f32,
    pub right_gain: f32,
}

impl Balance {
    pub const CENTERED: Balance = Balance {
        left_gain: 1.0,
        right_gain: 1.0,
    };

    /// Gains for a normalized position (0 leftmost, 1 rightmost).
    ///
    /// The near side stays at full gain, the far side fades linearly down
    /// to [`GAIN_FLOOR`] at the screen edge.
    pub fn for_position(position: f32) -> Self {
        let pos = position.clamp(0.0, 1.0);
        if pos <= 0.5 {
            Balance {
                left_gain: 1.0,
                right_gain: GAIN_FLOOR + (1.0 - GAIN_FLOOR) * (pos / 0.5),
            }
        } else {
            Balance {
                left_gain: GAIN_FLOOR + (1.0 - GAIN_FLOOR) * ((1.0 - pos) / 0.5),
                right_gain: 1.0,
            }
        }
    }
}

pub struct SpatialBalancer {
    tracker: WindowTracker,
    bound: Option<(ObjectId, ObjectId)>,
    base_volume: f32,
    balance: Balance,
}

impl SpatialBalancer {
    pub fn new(tracker: WindowTracker) -> Self {
        Self {
            tracker,
            bound: None,
            base_volume: DEFAULT_BASE_VOLUME,
            balance: Balance::CENTERED,
        }
    }

    pub fn is_active(&self) -> bool {
        self.bound.is_some()
    }

    pub fn base_volume(&self) -> f32 {
        self.base_volume
    }

    pub fn balance(&self) -> Balance {
        self.balance
    }

    /// Take over both endpoints, seeding the base volume from the primary.
    pub fn start(
        &mut self,
        backend: &dyn AudioBackend,
        primary: ObjectId,
        secondary: ObjectId,
        sender: Sender<EngineEvent>,
    ) {
        self.stop(backend);

        if let Some(level) = VolumeController::new(backend, primary).level() {
            self.base_volume = level;
        }
        self.bound = Some((primary, secondary));
        self.balance = Balance::CENTERED;
        info!(primary, secondary, base = self.base_volume, "spatial balance started");

        match self.tracker.start(sender) {
            Some(position) => self.update_balance(backend, position as f32),
            None => self.apply(backend),
        }
    }

    /// Poll the window tracker and rebalance if the focus moved.
    pub fn poll(&mut self, backend: &dyn AudioBackend) {
        if !self.is_active() {
            return;
        }
        if let Some(position) = self.tracker.poll() {
            self.update_balance(backend, position as f32);
        }
    }

    pub fn update_balance(&mut self, backend: &dyn AudioBackend, position: f32) {
        if !self.is_active() {
            return;
        }
        self.balance = Balance::for_position(position);
        debug!(position, left = self.balance.left_gain, right = self.balance.right_gain, "rebalanced");
        self.apply(backend);
    }

    /// Step the base volume and reapply both sides. Returns the new base.
    pub fn adjust_volume(&mut self, backend: &dyn AudioBackend, delta: f32) -> Option<f32> {
        if !self.is_active() {
            return None;
        }
        self.base_volume = (self.base_volume + delta).clamp(0.0, 1.0);
        self.apply(backend);
        Some(self.base_volume)
    }

    /// Toggle mute on both endpoints. Returns the base volume and the new state.
    pub fn toggle_mute(&self, backend: &dyn AudioBackend) -> Option<(f32, bool)> {
        let (primary, secondary) = self.bound?;
        let muted = !VolumeController::new(backend, primary).mute()?;
        VolumeController::new(backend, primary).set_mute(muted);
        VolumeController::new(backend, secondary).set_mute(muted);
        Some((self.base_volume, muted))
    }

    /// Stop tracking and level both surviving endpoints at the base volume.
    pub fn stop(&mut self, backend: &dyn AudioBackend) {
        let Some((primary, secondary)) = self.bound.take() else {
            return;
        };
        self.tracker.stop();

        for id in [primary, secondary] {
            let endpoint = VolumeController::new(backend, id);
            if endpoint.is_alive() {
                endpoint.set_volume_all(self.base_volume);
            }
        }
        self.balance = Balance::CENTERED;
        info!(base = self.base_volume, "spatial balance stopped");
    }

    fn apply(&self, backend: &dyn AudioBackend) {
        let Some((primary, secondary)) = self.bound else {
            return;
        };
        VolumeController::new(backend, primary).set_volume_all(self.base_volume * self.balance.left_gain);
        VolumeController::new(backend, secondary).set_volume_all(self.base_volume * self.balance.right_gain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedBackend, SimulatedDevice};
    use crate::events::create_event_channel;
    use crate::input::keys::VOLUME_STEP;
    use crate::window::{Rect, SimulatedWindowControl, SimulatedWindows};
    use proptest::prelude::*;

    fn balancer() -> (SimulatedBackend, ObjectId, ObjectId, SpatialBalancer, SimulatedWindowControl) {
        let backend = SimulatedBackend::new();
        let primary = backend.add_device(SimulatedDevice::output("l", "Left").with_volume(0.8));
        let secondary = backend.add_device(SimulatedDevice::output("r", "Right").with_volume(0.8));
        let (source, control) = SimulatedWindows::dual_display();
        let balancer = SpatialBalancer::new(WindowTracker::new(Box::new(source)));
        (backend, primary, secondary, balancer, control)
    }

    #[test]
    fn test_gain_at_edges_and_center() {
        assert_eq!(
            Balance::for_position(0.0),
            Balance {
                left_gain: 1.0,
                right_gain: GAIN_FLOOR
            }
        );
        assert_eq!(
            Balance::for_position(1.0),
            Balance {
                left_gain: GAIN_FLOOR,
                right_gain: 1.0
            }
        );
        assert_eq!(Balance::for_position(0.5), Balance::CENTERED);
    }

    #[test]
    fn test_window_on_right_attenuates_left() {
        let (backend, primary, secondary, mut balancer, control) = balancer();
        let (tx, _rx) = create_event_channel();
        control.activate(1, Rect::new(3440.0, 0.0, 400.0, 400.0));

        balancer.start(&backend, primary, secondary, tx);
        assert_eq!(balancer.base_volume(), 0.8);

        let left = VolumeController::new(&backend, primary).volume(0).unwrap();
        let right = VolumeController::new(&backend, secondary).volume(0).unwrap();
        assert_eq!(right, 0.8);
        assert!(left < 0.2);
    }

    #[test]
    fn test_base_volume_comes_from_left_channel_without_master() {
        let backend = SimulatedBackend::new();
        let primary = backend.add_device(SimulatedDevice::output("l", "Left").stereo_only().with_volume(0.2));
        let secondary = backend.add_device(SimulatedDevice::output("r", "Right").stereo_only().with_volume(0.2));
        let (source, control) = SimulatedWindows::dual_display();
        let mut balancer = SpatialBalancer::new(WindowTracker::new(Box::new(source)));
        let (tx, _rx) = create_event_channel();
        control.activate(1, Rect::new(3440.0, 0.0, 400.0, 400.0));

        balancer.start(&backend, primary, secondary, tx);
        assert_eq!(balancer.base_volume(), 0.2);
        assert_eq!(VolumeController::new(&backend, secondary).volume(1), Some(0.2));
    }

    #[test]
    fn test_start_without_window_levels_both_sides() {
        let (backend, primary, secondary, mut balancer, _control) = balancer();
        VolumeController::new(&backend, secondary).set_volume_all(0.3);
        let (tx, _rx) = create_event_channel();

        balancer.start(&backend, primary, secondary, tx);
        assert_eq!(balancer.balance(), Balance::CENTERED);
        for channel in 0..3 {
            assert_eq!(VolumeController::new(&backend, secondary).volume(channel), Some(0.8));
        }
    }

    #[test]
    fn test_stop_restores_equal_volume() {
        let (backend, primary, secondary, mut balancer, control) = balancer();
        let (tx, _rx) = create_event_channel();
        control.activate(1, Rect::new(0.0, 0.0, 400.0, 400.0));
        balancer.start(&backend, primary, secondary, tx);
        balancer.adjust_volume(&backend, -0.25);

        balancer.stop(&backend);
        for channel in 0..3 {
            assert_eq!(VolumeController::new(&backend, primary).volume(channel), Some(0.55));
            assert_eq!(VolumeController::new(&backend, secondary).volume(channel), Some(0.55));
        }
        assert!(!control.is_observing());
    }

    #[test]
    fn test_stop_skips_disconnected_endpoint() {
        let (backend, primary, secondary, mut balancer, control) = balancer();
        let (tx, _rx) = create_event_channel();
        control.activate(1, Rect::new(0.0, 0.0, 400.0, 400.0));
        balancer.start(&backend, primary, secondary, tx);

        backend.disconnect("r");
        balancer.stop(&backend);
        assert_eq!(VolumeController::new(&backend, primary).volume(0), Some(0.8));
    }

    #[test]
    fn test_toggle_mute_sets_both_sides() {
        let (backend, primary, secondary, mut balancer, _control) = balancer();
        let (tx, _rx) = create_event_channel();
        balancer.start(&backend, primary, secondary, tx);

        assert_eq!(balancer.toggle_mute(&backend), Some((0.8, true)));
        assert_eq!(VolumeController::new(&backend, secondary).mute(), Some(true));
    }

    proptest! {
        #[test]
        fn test_gains_stay_within_bounds(pos in -1.0f32..2.0) {
            let b = Balance::for_position(pos);
            prop_assert!((GAIN_FLOOR..=1.0).contains(&b.left_gain));
            prop_assert!((GAIN_FLOOR..=1.0).contains(&b.right_gain));
            prop_assert!(b.left_gain == 1.0 || b.right_gain == 1.0);
        }

        #[test]
        fn test_base_volume_steps_stay_in_range(
            start in 0.0f32..=1.0,
            steps in proptest::collection::vec(any::<bool>(), 1..40),
        ) {
            let (backend, primary, secondary, mut balancer, _control) = balancer();
            VolumeController::new(&backend, primary).set_volume_all(start);
            let (tx, _rx) = create_event_channel();
            balancer.start(&backend, primary, secondary, tx);

            for up in steps {
                let delta = if up { VOLUME_STEP } else { -VOLUME_STEP };
                let base = balancer.adjust_volume(&backend, delta).unwrap();
                prop_assert!((0.0..=1.0).contains(&base));
                for id in [primary, secondary] {
                    let level = VolumeController::new(&backend, id).volume(0).unwrap();
                    prop_assert!((0.0..=1.0).contains(&level));
                    prop_assert!(level <= base + 1e-6);
                }
            }
        }

        #[test]
        fn test_gains_are_monotonic(a in 0.0f32..=1.0, b in 0.0f32..=1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (at_lo, at_hi) = (Balance::for_position(lo), Balance::for_position(hi));
            prop_assert!(at_hi.left_gain <= at_lo.left_gain + 1e-6);
            prop_assert!(at_hi.right_gain + 1e-6 >= at_lo.right_gain);
        }
    }
}
