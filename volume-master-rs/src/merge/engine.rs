//! Merge session lifecycle.
//!
//! The engine is a plain synchronous state machine. OS callbacks never touch
//! it directly: they queue [`EngineEvent`]s which the owner drains through
//! [`MergeEngine::process_pending`] or feeds to [`MergeEngine::handle_event`].

use super::mirror::MirrorEngine;
use super::spatial::SpatialBalancer;
use super::{
    DisplaySink, KeyTapState, MergeError, MergePhase, MergeRequest, MergeStatus, VolumeIndicator, SETTLE_DELAY,
    SPLIT_STEREO_CHANNELS, VIRTUAL_DEVICE_NAME,
};
use crate::audio::device::{AudioDevice, AudioError, DeviceEvent, AGGREGATE_UID_PREFIX};
use crate::audio::enumerator::DeviceEnumerator;
use crate::audio::monitor::DeviceMonitor;
use crate::audio::property::{
    AggregateDescription, AudioBackend, ObjectId, PropertyAddress, PropertyValue, Selector, SubDevice,
};
use crate::events::{create_event_channel, EngineEvent};
use crate::input::{EventTap, KeyInterceptor, MediaKey};
use crate::window::{WindowSource, WindowTracker};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `kAudioHardwareUnspecifiedError` ('what').
const UNSPECIFIED_ERROR: i32 = i32::from_be_bytes(*b"what");

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Tear the merge down when a backing endpoint disconnects
    pub unmerge_on_disconnect: bool,
    /// Pause after creating the virtual endpoint
    pub settle_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            unmerge_on_disconnect: true,
            settle_delay: SETTLE_DELAY,
        }
    }
}

struct Session {
    primary_uid: String,
    secondary_uid: String,
    primary: ObjectId,
    secondary: ObjectId,
    virtual_id: ObjectId,
    virtual_uid: String,
    stereo_split: bool,
}

pub struct MergeEngine {
    directory: DeviceEnumerator,
    mirror: MirrorEngine,
    spatial: SpatialBalancer,
    keys: KeyInterceptor,
    monitor: DeviceMonitor,
    session: Option<Session>,
    phase: MergePhase,
    previous_default_uid: Option<String>,
    options: EngineOptions,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    active: Arc<AtomicBool>,
    display: Option<DisplaySink>,
}

impl MergeEngine {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        tap: Box<dyn EventTap>,
        windows: Box<dyn WindowSource>,
        options: EngineOptions,
    ) -> Self {
        let (events_tx, events_rx) = create_event_channel();
        Self {
            directory: DeviceEnumerator::new(backend),
            mirror: MirrorEngine::new(),
            spatial: SpatialBalancer::new(WindowTracker::new(windows)),
            keys: KeyInterceptor::new(tap),
            monitor: DeviceMonitor::new(),
            session: None,
            phase: MergePhase::Idle,
            previous_default_uid: None,
            options,
            events_tx,
            events_rx,
            active: Arc::new(AtomicBool::new(false)),
            display: None,
        }
    }

    pub fn directory(&self) -> &DeviceEnumerator {
        &self.directory
    }

    pub fn phase(&self) -> MergePhase {
        self.phase
    }

    pub fn is_merge_active(&self) -> bool {
        self.session.is_some()
    }

    /// Flag mirroring [`Self::is_merge_active`], readable from any thread.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// Queue that OS callbacks post to.
    pub fn event_sender(&self) -> Sender<EngineEvent> {
        self.events_tx.clone()
    }

    pub fn event_receiver(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    /// UID of the output that was default before the merge.
    pub fn previous_default_uid(&self) -> Option<&str> {
        self.previous_default_uid.as_deref()
    }

    pub fn set_display_sink(&mut self, sink: Option<DisplaySink>) {
        self.display = sink;
    }

    pub fn set_unmerge_on_disconnect(&mut self, enabled: bool) {
        self.options.unmerge_on_disconnect = enabled;
    }

    /// Watch the device list for disconnects of the merged endpoints.
    pub fn start_device_monitor(&mut self) -> Result<(), AudioError> {
        self.monitor.start(&self.directory, self.events_tx.clone())
    }

    /// Create the virtual endpoint, make it the default output and start
    /// mirroring or spatial balancing.
    pub fn create_merge(&mut self, request: &MergeRequest) -> Result<ObjectId, MergeError> {
        if self.phase != MergePhase::Idle {
            return Err(MergeError::AlreadyActive);
        }
        if request.primary_uid == request.secondary_uid {
            return Err(MergeError::SameEndpoint);
        }
        let primary = self.resolve(&request.primary_uid)?;
        let secondary = self.resolve(&request.secondary_uid)?;

        if let Some(current) = self.directory.default_output_device().filter(|d| !d.is_ours()) {
            self.previous_default_uid = Some(current.uid);
        }

        self.cleanup_orphans();

        let backend = self.directory.backend().clone();
        let description = Self::describe(request);
        let virtual_id = backend.create_aggregate(&description).map_err(|e| {
            warn!(error = %e, "virtual endpoint creation failed");
            MergeError::CreationFailed(creation_status(&e))
        })?;

        if !self.options.settle_delay.is_zero() {
            std::thread::sleep(self.options.settle_delay);
        }

        if request.stereo_split {
            let address = PropertyAddress::output(Selector::PreferredChannelsForStereo);
            let channels = PropertyValue::UIntList(SPLIT_STEREO_CHANNELS.to_vec());
            if let Err(e) = backend.set(virtual_id, address, &channels) {
                warn!(error = %e, "could not route stereo channels to both endpoints");
            }
        }

        if let Err(e) = self.directory.set_default_output_device(virtual_id) {
            warn!(error = %e, "could not make virtual endpoint the default output");
            if let Err(e) = backend.destroy_aggregate(virtual_id) {
                warn!(error = %e, "failed to destroy virtual endpoint");
            }
            return Err(MergeError::SetDefaultFailed(e));
        }

        self.session = Some(Session {
            primary_uid: request.primary_uid.clone(),
            secondary_uid: request.secondary_uid.clone(),
            primary,
            secondary,
            virtual_id,
            virtual_uid: description.uid.clone(),
            stereo_split: request.stereo_split,
        });
        self.active.store(true, Ordering::SeqCst);

        self.keys.start(primary, secondary, self.events_tx.clone());

        if request.stereo_split && request.spatial {
            self.spatial.start(backend.as_ref(), primary, secondary, self.events_tx.clone());
            self.phase = MergePhase::Spatial;
        } else {
            self.mirror.start(backend.as_ref(), primary, secondary, &self.events_tx);
            self.mirror.sync_now(backend.as_ref());
            self.phase = MergePhase::Mirrored;
        }

        info!(
            primary = %request.primary_uid,
            secondary = %request.secondary_uid,
            virtual_id,
            stereo_split = request.stereo_split,
            phase = ?self.phase,
            "merge created"
        );
        Ok(virtual_id)
    }

    /// Tear the merge down. A no-op when idle.
    ///
    /// If the virtual endpoint is still the default output, the previous
    /// default is restored before the endpoint goes away.
    pub fn destroy_merge(&mut self) {
        let Some(session) = self.session.take() else {
            self.phase = MergePhase::Idle;
            return;
        };
        self.phase = MergePhase::Transitioning;
        let backend = self.directory.backend().clone();

        self.spatial.stop(backend.as_ref());
        self.keys.stop();
        self.mirror.stop(backend.as_ref());

        let virtual_is_default = self
            .directory
            .default_output_device()
            .is_some_and(|d| d.id == session.virtual_id);
        if virtual_is_default {
            self.revert_default_output();
        }

        match backend.destroy_aggregate(session.virtual_id) {
            Ok(()) | Err(AudioError::EndpointNotFound { .. }) => {}
            Err(e) => warn!(error = %e, "failed to destroy virtual endpoint"),
        }

        self.phase = MergePhase::Idle;
        self.active.store(false, Ordering::SeqCst);
        info!(virtual_uid = %session.virtual_uid, "merge destroyed");
    }

    /// Restore the output that was default before the merge, looked up by UID.
    ///
    /// Returns false when nothing was recorded or that endpoint is gone.
    pub fn revert_default_output(&mut self) -> bool {
        let Some(uid) = self.previous_default_uid.clone() else {
            return false;
        };
        let device = match self.directory.get_device(&uid) {
            Ok(device) => device,
            Err(e) => {
                debug!(error = %e, "previous default output is gone");
                return false;
            }
        };
        match self.directory.set_default_output_device(device.id) {
            Ok(()) => {
                self.previous_default_uid = None;
                info!(uid = %device.uid, "default output reverted");
                true
            }
            Err(e) => {
                warn!(uid = %device.uid, error = %e, "failed to revert default output");
                false
            }
        }
    }

    /// Destroy every virtual endpoint left behind by an earlier run.
    ///
    /// The active session's endpoint is kept. Returns how many were removed.
    pub fn cleanup_orphans(&mut self) -> usize {
        let keep = self.session.as_ref().map(|s| s.virtual_id);
        let backend = self.directory.backend().clone();
        let orphans: Vec<AudioDevice> = self
            .directory
            .get_devices()
            .into_iter()
            .filter(|d| d.is_ours() && Some(d.id) != keep)
            .collect();

        let mut removed = 0;
        for orphan in orphans {
            match backend.destroy_aggregate(orphan.id) {
                Ok(()) => removed += 1,
                Err(e) => warn!(uid = %orphan.uid, error = %e, "failed to remove orphaned endpoint"),
            }
        }
        if removed > 0 {
            info!(removed, "orphaned virtual endpoints removed");
        }
        removed
    }

    /// Switch between mirroring and spatial balancing.
    ///
    /// Returns true when the mode changed. No-op outside an active merge.
    pub fn toggle_spatial(&mut self, enabled: bool) -> bool {
        let Some((primary, secondary)) = self.session.as_ref().map(|s| (s.primary, s.secondary)) else {
            return false;
        };
        let target = if enabled { MergePhase::Spatial } else { MergePhase::Mirrored };
        if self.phase == MergePhase::Transitioning || self.phase == target {
            return false;
        }

        self.phase = MergePhase::Transitioning;
        let backend = self.directory.backend().clone();
        if enabled {
            self.mirror.stop(backend.as_ref());
            self.spatial.start(backend.as_ref(), primary, secondary, self.events_tx.clone());
        } else {
            self.spatial.stop(backend.as_ref());
            self.mirror.start(backend.as_ref(), primary, secondary, &self.events_tx);
            self.mirror.sync_now(backend.as_ref());
        }
        self.phase = target;
        info!(phase = ?self.phase, "merge mode switched");
        true
    }

    pub fn status(&self) -> MergeStatus {
        let key_tap = if self.keys.is_installed() {
            KeyTapState::Installed
        } else if self.keys.is_retrying() {
            KeyTapState::AwaitingPermission
        } else {
            KeyTapState::Inactive
        };
        MergeStatus {
            phase: self.phase,
            primary_uid: self.session.as_ref().map(|s| s.primary_uid.clone()),
            secondary_uid: self.session.as_ref().map(|s| s.secondary_uid.clone()),
            virtual_uid: self.session.as_ref().map(|s| s.virtual_uid.clone()),
            stereo_split: self.session.as_ref().is_some_and(|s| s.stereo_split),
            spatial: self.phase == MergePhase::Spatial,
            key_tap,
        }
    }

    /// Handle every queued event. Returns how many were processed.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::PropertiesChanged { object, addresses } => {
                if self.phase == MergePhase::Mirrored {
                    let backend = self.directory.backend().clone();
                    self.mirror.handle_change(backend.as_ref(), object, &addresses);
                }
            }
            EngineEvent::DeviceListChanged => self.on_device_list_changed(),
            EngineEvent::MediaKey(key) => self.handle_media_key(key),
            EngineEvent::AppActivated => self.on_window_tick(),
        }
    }

    /// Apply a swallowed volume key to whichever mode owns the volume.
    pub fn handle_media_key(&mut self, key: MediaKey) {
        let backend = self.directory.backend().clone();
        let backend = backend.as_ref();
        let indicator = match (self.phase, key.volume_delta()) {
            (MergePhase::Spatial, Some(delta)) => self
                .spatial
                .adjust_volume(backend, delta)
                .map(|volume| VolumeIndicator { volume, muted: None }),
            (MergePhase::Spatial, None) => self
                .spatial
                .toggle_mute(backend)
                .map(|(volume, muted)| VolumeIndicator {
                    volume,
                    muted: Some(muted),
                }),
            (MergePhase::Mirrored, Some(delta)) => self
                .keys
                .adjust_volume(backend, delta)
                .map(|volume| VolumeIndicator { volume, muted: None }),
            (MergePhase::Mirrored, None) => self
                .keys
                .toggle_mute(backend)
                .map(|(volume, muted)| VolumeIndicator {
                    volume,
                    muted: Some(muted),
                }),
            _ => None,
        };
        if let Some(indicator) = indicator {
            debug!(?key, volume = indicator.volume, "volume key handled");
            if let Some(display) = &self.display {
                display(indicator);
            }
        }
    }

    /// Poll the focused window while spatial balancing runs.
    pub fn on_window_tick(&mut self) {
        if self.phase == MergePhase::Spatial {
            let backend = self.directory.backend().clone();
            self.spatial.poll(backend.as_ref());
        }
    }

    /// Retry a pending key tap installation.
    pub fn on_retry_tick(&mut self) {
        if self.keys.is_retrying() && self.keys.on_retry_tick() {
            info!("volume key tap installed after permission grant");
        }
    }

    /// Revert the default output and destroy any active merge.
    pub fn shutdown(&mut self) {
        if self.is_merge_active() {
            self.revert_default_output();
            self.destroy_merge();
        }
        self.monitor.stop(&self.directory);
    }

    fn on_device_list_changed(&mut self) {
        let Some(DeviceEvent::DevicesChanged {
            connected,
            disconnected,
        }) = self.monitor.refresh(&self.directory)
        else {
            return;
        };
        debug!(?connected, ?disconnected, "device list changed");

        let Some(session) = &self.session else {
            return;
        };
        let lost = [&session.primary_uid, &session.secondary_uid, &session.virtual_uid]
            .into_iter()
            .find(|uid| disconnected.contains(*uid))
            .cloned();
        if let Some(uid) = lost {
            if self.options.unmerge_on_disconnect {
                warn!(%uid, "merged endpoint disconnected, unmerging");
                self.revert_default_output();
                self.destroy_merge();
            } else {
                warn!(%uid, "merged endpoint disconnected");
            }
        }
    }

    fn resolve(&self, uid: &str) -> Result<ObjectId, MergeError> {
        self.directory
            .device_id_for_uid(uid)
            .ok_or_else(|| MergeError::UnknownEndpoint { uid: uid.to_string() })
    }

    fn describe(request: &MergeRequest) -> AggregateDescription {
        let uid = format!("{}{}", AGGREGATE_UID_PREFIX, Uuid::new_v4().to_string().to_uppercase());
        AggregateDescription {
            name: VIRTUAL_DEVICE_NAME.to_string(),
            uid,
            sub_devices: vec![
                SubDevice {
                    uid: request.primary_uid.clone(),
                    drift_compensation: false,
                },
                SubDevice {
                    uid: request.secondary_uid.clone(),
                    drift_compensation: true,
                },
            ],
            master_uid: request.primary_uid.clone(),
            is_private: false,
            is_stacked: request.stereo_split,
        }
    }
}

fn creation_status(error: &AudioError) -> i32 {
    match error {
        AudioError::CreationFailed(status) | AudioError::OsStatus { status, .. } => *status,
        _ => UNSPECIFIED_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedBackend, SimulatedDevice};
    use crate::audio::volume::VolumeController;
    use crate::input::{SimulatedTap, SimulatedTapControl};
    use crate::window::{Rect, SimulatedWindowControl, SimulatedWindows};
    use parking_lot::Mutex;

    struct Fixture {
        backend: Arc<SimulatedBackend>,
        engine: MergeEngine,
        tap: SimulatedTapControl,
        windows: SimulatedWindowControl,
    }

    fn fixture(trusted: bool) -> Fixture {
        let backend = Arc::new(SimulatedBackend::new());
        backend.add_device(SimulatedDevice::output("speakers", "Speakers"));
        backend.add_device(SimulatedDevice::output("left", "Left"));
        backend.add_device(SimulatedDevice::output("right", "Right").with_volume(0.2));
        let (tap, tap_control) = SimulatedTap::new(trusted);
        let (windows, window_control) = SimulatedWindows::dual_display();
        let engine = MergeEngine::new(
            backend.clone(),
            Box::new(tap),
            Box::new(windows),
            EngineOptions {
                unmerge_on_disconnect: true,
                settle_delay: Duration::ZERO,
            },
        );
        Fixture {
            backend,
            engine,
            tap: tap_control,
            windows: window_control,
        }
    }

    fn request(stereo_split: bool, spatial: bool) -> MergeRequest {
        MergeRequest {
            primary_uid: "left".to_string(),
            secondary_uid: "right".to_string(),
            stereo_split,
            spatial,
        }
    }

    fn volume(backend: &SimulatedBackend, uid: &str, channel: u32) -> Option<f32> {
        let id = backend.device_id(uid)?;
        VolumeController::new(backend, id).volume(channel)
    }

    #[test]
    fn test_create_merge_builds_aggregate() {
        let mut f = fixture(true);
        let id = f.engine.create_merge(&request(false, false)).unwrap();

        let aggregates = f.backend.aggregates();
        assert_eq!(aggregates.len(), 1);
        let description = &aggregates[0];
        assert!(description.uid.starts_with(AGGREGATE_UID_PREFIX));
        assert_eq!(description.name, VIRTUAL_DEVICE_NAME);
        assert_eq!(description.master_uid, "left");
        assert!(!description.sub_devices[0].drift_compensation);
        assert!(description.sub_devices[1].drift_compensation);
        assert!(!description.is_stacked);

        assert_eq!(f.backend.default_output_uid(), Some(description.uid.clone()));
        assert_eq!(f.engine.phase(), MergePhase::Mirrored);
        assert!(f.engine.active_flag().load(Ordering::SeqCst));
        assert_eq!(f.engine.previous_default_uid(), Some("speakers"));
        assert_eq!(f.backend.device_id(&description.uid), Some(id));
        // secondary synced on start
        assert_eq!(volume(&f.backend, "right", 0), Some(0.5));
    }

    #[test]
    fn test_stereo_split_routes_channels() {
        let mut f = fixture(true);
        let id = f.engine.create_merge(&request(true, false)).unwrap();
        assert!(f.backend.aggregates()[0].is_stacked);
        assert_eq!(f.backend.preferred_stereo(id), Some(vec![1, 3]));
    }

    #[test]
    fn test_invalid_requests_leave_engine_idle() {
        let mut f = fixture(true);
        let mut same = request(false, false);
        same.secondary_uid = "left".to_string();
        assert_eq!(f.engine.create_merge(&same), Err(MergeError::SameEndpoint));

        let mut unknown = request(false, false);
        unknown.secondary_uid = "missing".to_string();
        assert_eq!(
            f.engine.create_merge(&unknown),
            Err(MergeError::UnknownEndpoint {
                uid: "missing".to_string()
            })
        );

        f.backend.fail_next_create(-50);
        assert_eq!(f.engine.create_merge(&request(false, false)), Err(MergeError::CreationFailed(-50)));
        assert_eq!(f.engine.phase(), MergePhase::Idle);
        assert!(f.backend.aggregates().is_empty());
        assert_eq!(f.backend.default_output_uid().as_deref(), Some("speakers"));
    }

    #[test]
    fn test_second_merge_is_rejected() {
        let mut f = fixture(true);
        f.engine.create_merge(&request(false, false)).unwrap();
        assert_eq!(f.engine.create_merge(&request(false, false)), Err(MergeError::AlreadyActive));
        assert_eq!(f.backend.aggregates().len(), 1);
    }

    #[test]
    fn test_destroy_restores_default_and_is_idempotent() {
        let mut f = fixture(true);
        f.engine.create_merge(&request(false, false)).unwrap();

        f.engine.destroy_merge();
        assert_eq!(f.backend.default_output_uid().as_deref(), Some("speakers"));
        assert!(f.backend.aggregates().is_empty());
        assert!(!f.engine.is_merge_active());
        assert!(!f.tap.is_installed());
        assert_eq!(f.backend.listener_count(f.backend.device_id("left").unwrap()), 0);

        f.engine.destroy_merge();
        assert_eq!(f.engine.phase(), MergePhase::Idle);
    }

    #[test]
    fn test_failed_revert_keeps_previous_default() {
        let mut f = fixture(true);
        f.engine.create_merge(&request(false, false)).unwrap();

        f.backend.fail_next_default_output(-50);
        assert!(!f.engine.revert_default_output());
        assert_eq!(f.engine.previous_default_uid(), Some("speakers"));

        assert!(f.engine.revert_default_output());
        assert_eq!(f.backend.default_output_uid().as_deref(), Some("speakers"));
        assert_eq!(f.engine.previous_default_uid(), None);
    }

    #[test]
    fn test_orphans_are_removed_before_merge() {
        let mut f = fixture(true);
        f.backend
            .create_aggregate(&MergeEngine::describe(&request(false, false)))
            .unwrap();
        f.engine.create_merge(&request(false, false)).unwrap();
        assert_eq!(f.backend.aggregates().len(), 1);

        // the active session survives a cleanup
        assert_eq!(f.engine.cleanup_orphans(), 0);
        assert_eq!(f.backend.aggregates().len(), 1);
    }

    #[test]
    fn test_mirroring_stops_in_spatial_mode() {
        let mut f = fixture(true);
        f.engine.create_merge(&request(true, false)).unwrap();
        let left = f.backend.device_id("left").unwrap();

        VolumeController::new(f.backend.as_ref(), left).set_volume(0, 0.3);
        f.engine.process_pending();
        assert_eq!(volume(&f.backend, "right", 0), Some(0.3));

        assert!(f.engine.toggle_spatial(true));
        assert!(!f.engine.toggle_spatial(true));
        VolumeController::new(f.backend.as_ref(), left).set_volume(0, 0.9);
        f.engine.process_pending();
        assert_ne!(volume(&f.backend, "right", 0), Some(0.9));

        assert!(f.engine.toggle_spatial(false));
        assert_eq!(volume(&f.backend, "left", 0), volume(&f.backend, "right", 0));
    }

    #[test]
    fn test_spatial_toggle_outside_merge_is_noop() {
        let mut f = fixture(true);
        assert!(!f.engine.toggle_spatial(true));
        assert_eq!(f.engine.phase(), MergePhase::Idle);
    }

    #[test]
    fn test_volume_keys_drive_both_endpoints() {
        let mut f = fixture(true);
        let shown = Arc::new(Mutex::new(Vec::new()));
        let sink = shown.clone();
        f.engine
            .set_display_sink(Some(Arc::new(move |i: VolumeIndicator| sink.lock().push(i))));
        f.engine.create_merge(&request(false, false)).unwrap();

        f.tap.press(MediaKey::VolumeUp);
        f.engine.process_pending();
        assert_eq!(volume(&f.backend, "left", 1), Some(0.5625));
        assert_eq!(volume(&f.backend, "right", 1), Some(0.5625));

        f.tap.press(MediaKey::Mute);
        f.engine.process_pending();
        assert_eq!(
            shown.lock().as_slice(),
            &[
                VolumeIndicator {
                    volume: 0.5625,
                    muted: None
                },
                VolumeIndicator {
                    volume: 0.5625,
                    muted: Some(true)
                },
            ]
        );
    }

    #[test]
    fn test_volume_keys_in_spatial_mode_move_base_volume() {
        let mut f = fixture(true);
        f.windows.activate(1, Rect::new(3440.0, 0.0, 400.0, 400.0));
        f.engine.create_merge(&request(true, true)).unwrap();
        assert_eq!(f.engine.phase(), MergePhase::Spatial);

        f.tap.press(MediaKey::VolumeDown);
        f.engine.process_pending();
        assert_eq!(volume(&f.backend, "right", 0), Some(0.4375));
        assert!(volume(&f.backend, "left", 0).unwrap() < 0.2);
    }

    #[test]
    fn test_spatial_merge_levels_secondary_with_centered_window() {
        let mut f = fixture(true);
        f.windows.activate(1, Rect::new(1720.0, 0.0, 400.0, 400.0));
        f.engine.create_merge(&request(true, true)).unwrap();
        f.engine.on_window_tick();

        assert_eq!(volume(&f.backend, "left", 0), Some(0.5));
        assert_eq!(volume(&f.backend, "right", 0), Some(0.5));
    }

    #[test]
    fn test_window_moves_rebalance_on_tick() {
        let mut f = fixture(true);
        f.windows.activate(1, Rect::new(0.0, 0.0, 400.0, 400.0));
        f.engine.create_merge(&request(true, true)).unwrap();
        assert_eq!(volume(&f.backend, "left", 0), Some(0.5));

        f.windows.move_front_window(Rect::new(3440.0, 0.0, 400.0, 400.0));
        f.engine.on_window_tick();
        assert_eq!(volume(&f.backend, "right", 0), Some(0.5));
        assert!(volume(&f.backend, "left", 0).unwrap() < 0.15);
    }

    #[test]
    fn test_key_tap_waits_for_permission() {
        let mut f = fixture(false);
        f.engine.create_merge(&request(false, false)).unwrap();
        assert_eq!(f.engine.status().key_tap, KeyTapState::AwaitingPermission);
        assert_eq!(f.tap.prompts(), 1);

        f.engine.on_retry_tick();
        assert!(!f.tap.is_installed());

        f.tap.grant_permission();
        f.engine.on_retry_tick();
        assert_eq!(f.engine.status().key_tap, KeyTapState::Installed);
    }

    #[test]
    fn test_disconnect_unmerges() {
        let mut f = fixture(true);
        f.engine.start_device_monitor().unwrap();
        f.engine.create_merge(&request(false, false)).unwrap();
        f.engine.process_pending();

        f.backend.disconnect("right");
        f.engine.process_pending();
        assert!(!f.engine.is_merge_active());
        assert!(f.backend.aggregates().is_empty());
        assert_eq!(f.backend.default_output_uid().as_deref(), Some("speakers"));
    }

    #[test]
    fn test_status_reports_session() {
        let mut f = fixture(true);
        f.engine.create_merge(&request(true, true)).unwrap();
        let status = f.engine.status();
        assert_eq!(status.phase, MergePhase::Spatial);
        assert_eq!(status.primary_uid.as_deref(), Some("left"));
        assert!(status.stereo_split);
        assert!(status.spatial);
        assert_eq!(status.key_tap, KeyTapState::Installed);
    }
}
