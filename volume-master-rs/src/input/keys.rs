//! Hardware volume key interception.
//!
//! The key tap sees every system-defined event. Volume up/down/mute key-down
//! events are swallowed and forwarded to the coordinator; everything else,
//! including key-up events, passes through untouched.

use super::tap::{EventTap, KeySink, TapError};
use crate::audio::property::{AudioBackend, ObjectId};
use crate::audio::volume::{VolumeController, MONITORED_CHANNELS};
use crate::events::EngineEvent;
use crossbeam_channel::Sender;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `NX_SYSDEFINED` event type.
pub const NX_SYSDEFINED: u32 = 14;

/// Event subtype carrying auxiliary control buttons (media keys).
pub const NX_SUBTYPE_AUX_CONTROL_BUTTONS: i16 = 8;

const NX_KEYTYPE_SOUND_UP: i64 = 0;
const NX_KEYTYPE_SOUND_DOWN: i64 = 1;
const NX_KEYTYPE_MUTE: i64 = 7;

const KEY_STATE_DOWN: i64 = 0x0A;
const KEY_STATE_UP: i64 = 0x0B;

/// Volume change per key press, the same increment the OS uses.
pub const VOLUME_STEP: f32 = 1.0 / 16.0;

/// Volume keys handled by the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKey {
    VolumeUp,
    VolumeDown,
    Mute,
}

impl MediaKey {
    fn key_code(self) -> i64 {
        match self {
            MediaKey::VolumeUp => NX_KEYTYPE_SOUND_UP,
            MediaKey::VolumeDown => NX_KEYTYPE_SOUND_DOWN,
            MediaKey::Mute => NX_KEYTYPE_MUTE,
        }
    }

    fn from_key_code(code: i64) -> Option<Self> {
        match code {
            NX_KEYTYPE_SOUND_UP => Some(MediaKey::VolumeUp),
            NX_KEYTYPE_SOUND_DOWN => Some(MediaKey::VolumeDown),
            NX_KEYTYPE_MUTE => Some(MediaKey::Mute),
            _ => None,
        }
    }

    /// Signed volume step for this key, `None` for mute.
    pub fn volume_delta(self) -> Option<f32> {
        match self {
            MediaKey::VolumeUp => Some(VOLUME_STEP),
            MediaKey::VolumeDown => Some(-VOLUME_STEP),
            MediaKey::Mute => None,
        }
    }
}

/// What the OS handed to the tap callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapEvent {
    /// The OS disabled the tap (callback timeout or user input)
    Disabled,
    /// A system-defined event with its subtype and `data1` payload
    SystemDefined { subtype: i16, data1: i64 },
    /// Any other event type
    Other,
}

impl TapEvent {
    /// Encode a media key event the way the HID system reports it.
    pub fn media_key(key: MediaKey, down: bool) -> Self {
        let state = if down { KEY_STATE_DOWN } else { KEY_STATE_UP };
        TapEvent::SystemDefined {
            subtype: NX_SUBTYPE_AUX_CONTROL_BUTTONS,
            data1: (key.key_code() << 16) | (state << 8),
        }
    }
}

/// Decision returned to the tap callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapVerdict {
    /// Let the event continue to the OS
    Pass,
    /// Drop the event and handle the key ourselves
    Swallow(MediaKey),
    /// Re-enable the tap, then let the event continue
    Reenable,
}

/// Classify an event seen by the tap.
pub fn classify(event: TapEvent) -> TapVerdict {
    let (subtype, data1) = match event {
        TapEvent::Disabled => return TapVerdict::Reenable,
        TapEvent::Other => return TapVerdict::Pass,
        TapEvent::SystemDefined { subtype, data1 } => (subtype, data1),
    };
    if subtype != NX_SUBTYPE_AUX_CONTROL_BUTTONS {
        return TapVerdict::Pass;
    }

    let key_code = (data1 & 0xFFFF_0000) >> 16;
    let key_state = (data1 & 0xFF00) >> 8;
    if key_state != KEY_STATE_DOWN {
        return TapVerdict::Pass;
    }

    match MediaKey::from_key_code(key_code) {
        Some(key) => TapVerdict::Swallow(key),
        None => TapVerdict::Pass,
    }
}

/// Owns the global key tap and the endpoints volume keys are redirected to.
pub struct KeyInterceptor {
    tap: Box<dyn EventTap>,
    bound: Option<(ObjectId, ObjectId)>,
    sink: Option<KeySink>,
    retry_pending: bool,
    prompted: bool,
}

impl KeyInterceptor {
    pub fn new(tap: Box<dyn EventTap>) -> Self {
        Self {
            tap,
            bound: None,
            sink: None,
            retry_pending: false,
            prompted: false,
        }
    }

    /// Bind to the two physical endpoints and install the tap.
    ///
    /// Without accessibility permission the user is prompted once per
    /// process, and installation is retried on every [`Self::on_retry_tick`].
    pub fn start(&mut self, primary: ObjectId, secondary: ObjectId, sender: Sender<EngineEvent>) {
        self.stop();

        self.bound = Some((primary, secondary));
        self.sink = Some(Arc::new(move |key: MediaKey| {
            let _ = sender.send(EngineEvent::MediaKey(key));
        }));

        if !self.tap.is_trusted() && !self.prompted {
            self.prompted = true;
            info!("requesting accessibility permission for volume keys");
            self.tap.prompt_for_permission();
        }

        if !self.try_install() {
            self.retry_pending = true;
        }
    }

    /// Retry a pending installation. Returns true once the tap is installed.
    pub fn on_retry_tick(&mut self) -> bool {
        if !self.retry_pending {
            return self.tap.is_installed();
        }
        if self.try_install() {
            self.retry_pending = false;
            return true;
        }
        false
    }

    /// Remove the tap, cancel retries and forget the bound endpoints.
    pub fn stop(&mut self) {
        if self.tap.is_installed() {
            self.tap.uninstall();
            debug!("volume key tap removed");
        }
        self.retry_pending = false;
        self.bound = None;
        self.sink = None;
    }

    pub fn is_installed(&self) -> bool {
        self.tap.is_installed()
    }

    pub fn is_retrying(&self) -> bool {
        self.retry_pending
    }

    pub fn bound(&self) -> Option<(ObjectId, ObjectId)> {
        self.bound
    }

    /// Step the volume of every monitored channel on both endpoints.
    ///
    /// Writes both endpoints directly instead of waiting for the mirror.
    /// Returns the resulting primary volume for the overlay.
    pub fn adjust_volume(&self, backend: &dyn AudioBackend, delta: f32) -> Option<f32> {
        let (primary_id, secondary_id) = self.bound?;
        let primary = VolumeController::new(backend, primary_id);
        let secondary = VolumeController::new(backend, secondary_id);

        for channel in MONITORED_CHANNELS {
            if let Some(current) = primary.volume(channel) {
                let level = (current + delta).clamp(0.0, 1.0);
                primary.set_volume(channel, level);
                secondary.set_volume(channel, level);
            }
        }

        primary.level()
    }

    /// Toggle mute on both endpoints. Returns the primary volume and the new state.
    pub fn toggle_mute(&self, backend: &dyn AudioBackend) -> Option<(f32, bool)> {
        let (primary_id, secondary_id) = self.bound?;
        let primary = VolumeController::new(backend, primary_id);
        let secondary = VolumeController::new(backend, secondary_id);

        let muted = !primary.mute()?;
        primary.set_mute(muted);
        secondary.set_mute(muted);

        let volume = primary.level()?;
        Some((volume, muted))
    }

    fn try_install(&mut self) -> bool {
        if self.tap.is_installed() {
            return true;
        }
        let Some(sink) = self.sink.clone() else {
            return false;
        };
        match self.tap.install(sink) {
            Ok(()) => {
                info!("volume key tap installed");
                true
            }
            Err(TapError::PermissionDenied) => {
                debug!("volume key tap not permitted yet, will retry");
                false
            }
            Err(e) => {
                warn!(error = %e, "volume key tap installation failed, will retry");
                false
            }
        }
    }
}

impl Drop for KeyInterceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedBackend, SimulatedDevice};
    use crate::events::create_event_channel;
    use crate::input::tap::SimulatedTap;
    use proptest::prelude::*;

    #[test]
    fn test_classify_key_down_is_swallowed() {
        assert_eq!(
            classify(TapEvent::media_key(MediaKey::VolumeUp, true)),
            TapVerdict::Swallow(MediaKey::VolumeUp)
        );
        assert_eq!(
            classify(TapEvent::media_key(MediaKey::Mute, true)),
            TapVerdict::Swallow(MediaKey::Mute)
        );
    }

    #[test]
    fn test_classify_passes_key_up_and_other_keys() {
        assert_eq!(classify(TapEvent::media_key(MediaKey::VolumeDown, false)), TapVerdict::Pass);
        // NX_KEYTYPE_PLAY = 16
        assert_eq!(
            classify(TapEvent::SystemDefined {
                subtype: NX_SUBTYPE_AUX_CONTROL_BUTTONS,
                data1: (16 << 16) | (KEY_STATE_DOWN << 8),
            }),
            TapVerdict::Pass
        );
        assert_eq!(
            classify(TapEvent::SystemDefined { subtype: 7, data1: 0 }),
            TapVerdict::Pass
        );
        assert_eq!(classify(TapEvent::Other), TapVerdict::Pass);
    }

    #[test]
    fn test_classify_disabled_requests_reenable() {
        assert_eq!(classify(TapEvent::Disabled), TapVerdict::Reenable);
    }

    #[test]
    fn test_prompt_once_and_retry_until_granted() {
        let (tap, control) = SimulatedTap::new(false);
        let mut interceptor = KeyInterceptor::new(Box::new(tap));
        let (tx, _rx) = create_event_channel();

        interceptor.start(100, 101, tx.clone());
        assert!(interceptor.is_retrying());
        assert!(!interceptor.is_installed());
        assert!(!interceptor.on_retry_tick());

        // a second start in the same process does not prompt again
        interceptor.start(100, 101, tx);
        assert_eq!(control.prompts(), 1);

        control.grant_permission();
        assert!(interceptor.on_retry_tick());
        assert!(!interceptor.is_retrying());
        assert!(interceptor.is_installed());
    }

    #[test]
    fn test_stop_cancels_retry_and_is_idempotent() {
        let (tap, control) = SimulatedTap::new(false);
        let mut interceptor = KeyInterceptor::new(Box::new(tap));
        let (tx, _rx) = create_event_channel();

        interceptor.start(100, 101, tx);
        interceptor.stop();
        interceptor.stop();
        assert!(!interceptor.is_retrying());
        assert_eq!(interceptor.bound(), None);

        control.grant_permission();
        assert!(!interceptor.on_retry_tick());
        assert!(!control.is_installed());
    }

    #[test]
    fn test_swallowed_keys_reach_the_coordinator() {
        let (tap, control) = SimulatedTap::new(true);
        let mut interceptor = KeyInterceptor::new(Box::new(tap));
        let (tx, rx) = create_event_channel();
        interceptor.start(100, 101, tx);

        assert_eq!(
            control.deliver(TapEvent::media_key(MediaKey::VolumeDown, true)),
            TapVerdict::Swallow(MediaKey::VolumeDown)
        );
        assert_eq!(
            control.deliver(TapEvent::media_key(MediaKey::VolumeDown, false)),
            TapVerdict::Pass
        );
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::MediaKey(MediaKey::VolumeDown));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_adjust_volume_writes_both_endpoints() {
        let backend = SimulatedBackend::new();
        let a = backend.add_device(SimulatedDevice::output("a", "A").with_volume(0.5));
        let b = backend.add_device(SimulatedDevice::output("b", "B").with_volume(0.2));
        let (tap, _control) = SimulatedTap::new(true);
        let mut interceptor = KeyInterceptor::new(Box::new(tap));
        let (tx, _rx) = create_event_channel();
        interceptor.start(a, b, tx);

        let shown = interceptor.adjust_volume(&backend, VOLUME_STEP).unwrap();
        assert!((shown - 0.5625).abs() < 1e-6);
        for channel in MONITORED_CHANNELS {
            assert_eq!(VolumeController::new(&backend, b).volume(channel), Some(shown));
        }

        let (_, muted) = interceptor.toggle_mute(&backend).unwrap();
        assert!(muted);
        assert_eq!(VolumeController::new(&backend, b).mute(), Some(true));
    }

    #[test]
    fn test_adjust_volume_clamps_at_full_scale() {
        let backend = SimulatedBackend::new();
        let a = backend.add_device(SimulatedDevice::output("a", "A").with_volume(0.99));
        let b = backend.add_device(SimulatedDevice::output("b", "B"));
        let (tap, _control) = SimulatedTap::new(true);
        let mut interceptor = KeyInterceptor::new(Box::new(tap));
        let (tx, _rx) = create_event_channel();
        interceptor.start(a, b, tx);

        assert_eq!(interceptor.adjust_volume(&backend, VOLUME_STEP), Some(1.0));
    }

    proptest! {
        #[test]
        fn test_volume_steps_stay_in_range(
            start in 0.0f32..=1.0,
            steps in proptest::collection::vec(any::<bool>(), 1..40),
        ) {
            let backend = SimulatedBackend::new();
            let a = backend.add_device(SimulatedDevice::output("a", "A").with_volume(start));
            let b = backend.add_device(SimulatedDevice::output("b", "B").stereo_only());
            let (tap, _control) = SimulatedTap::new(true);
            let mut interceptor = KeyInterceptor::new(Box::new(tap));
            let (tx, _rx) = create_event_channel();
            interceptor.start(a, b, tx);

            for up in steps {
                let delta = if up { VOLUME_STEP } else { -VOLUME_STEP };
                let shown = interceptor.adjust_volume(&backend, delta).unwrap();
                prop_assert!((0.0..=1.0).contains(&shown));
                for channel in MONITORED_CHANNELS {
                    for id in [a, b] {
                        if let Some(level) = VolumeController::new(&backend, id).volume(channel) {
                            prop_assert!((0.0..=1.0).contains(&level));
                        }
                    }
                }
            }
        }
    }
}
