//! End-to-end merge behavior on the simulated backend.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use volume_master_rs::audio::{
    AggregateDescription, AudioBackend, SimulatedBackend, SimulatedDevice, SubDevice, VolumeController,
    AGGREGATE_UID_PREFIX,
};
use volume_master_rs::input::SimulatedTap;
use volume_master_rs::merge::{EngineOptions, MergeEngine, MergePhase, MergeRequest};
use volume_master_rs::window::{Rect, SimulatedWindows};

const OUTPUTS: [&str; 4] = ["speakers", "headphones", "left", "right"];

fn engine_with(backend: &Arc<SimulatedBackend>) -> MergeEngine {
    let (tap, _tap) = SimulatedTap::new(true);
    let (windows, control) = SimulatedWindows::dual_display();
    control.activate(7, Rect::new(100.0, 100.0, 800.0, 600.0));
    MergeEngine::new(
        backend.clone(),
        Box::new(tap),
        Box::new(windows),
        EngineOptions {
            unmerge_on_disconnect: true,
            settle_delay: Duration::ZERO,
        },
    )
}

fn setup() -> (Arc<SimulatedBackend>, MergeEngine) {
    let backend = Arc::new(SimulatedBackend::new());
    for uid in OUTPUTS {
        backend.add_device(SimulatedDevice::output(uid, uid));
    }
    let engine = engine_with(&backend);
    (backend, engine)
}

fn request(primary: &str, secondary: &str, stereo_split: bool) -> MergeRequest {
    MergeRequest {
        primary_uid: primary.to_string(),
        secondary_uid: secondary.to_string(),
        stereo_split,
        spatial: false,
    }
}

fn volume(backend: &SimulatedBackend, uid: &str) -> Option<f32> {
    let id = backend.device_id(uid)?;
    VolumeController::new(backend, id).volume(0)
}

fn foreign_aggregate(uid: &str) -> AggregateDescription {
    AggregateDescription {
        name: "Leftover".to_string(),
        uid: uid.to_string(),
        sub_devices: vec![SubDevice {
            uid: "speakers".to_string(),
            drift_compensation: false,
        }],
        master_uid: "speakers".to_string(),
        is_private: false,
        is_stacked: false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_unmerge_restores_previous_default(
        default in 0usize..4,
        primary in 0usize..4,
        offset in 1usize..4,
        stereo_split in any::<bool>(),
    ) {
        let (backend, mut engine) = setup();
        let secondary = (primary + offset) % OUTPUTS.len();
        let default_id = backend.device_id(OUTPUTS[default]).unwrap();
        engine.directory().set_default_output_device(default_id).unwrap();

        engine.create_merge(&request(OUTPUTS[primary], OUTPUTS[secondary], stereo_split)).unwrap();
        let uid_after_merge = backend.default_output_uid();
        prop_assert_ne!(uid_after_merge.as_deref(), Some(OUTPUTS[default]));

        engine.destroy_merge();
        let uid_after_destroy = backend.default_output_uid();
        prop_assert_eq!(uid_after_destroy.as_deref(), Some(OUTPUTS[default]));
        prop_assert!(backend.aggregates().is_empty());
    }
}

#[test]
fn test_destroy_is_idempotent() {
    let (_backend, mut engine) = setup();
    engine.destroy_merge();
    assert_eq!(engine.phase(), MergePhase::Idle);

    engine.create_merge(&request("left", "right", false)).unwrap();
    engine.destroy_merge();
    engine.destroy_merge();
    assert_eq!(engine.phase(), MergePhase::Idle);
    assert!(!engine.is_merge_active());
}

#[test]
fn test_mirroring_is_exclusive_with_spatial() {
    let (backend, mut engine) = setup();
    engine.create_merge(&request("left", "right", true)).unwrap();
    let left = backend.device_id("left").unwrap();

    VolumeController::new(backend.as_ref(), left).set_volume(0, 0.7);
    engine.process_pending();
    assert_eq!(volume(&backend, "right"), Some(0.7));

    assert!(engine.toggle_spatial(true));
    let right_before = volume(&backend, "right");
    VolumeController::new(backend.as_ref(), left).set_volume(0, 0.1);
    engine.process_pending();
    assert_eq!(volume(&backend, "right"), right_before);
}

#[test]
fn test_spatial_round_trip_leaves_no_skew() {
    let (backend, mut engine) = setup();
    engine.create_merge(&request("left", "right", true)).unwrap();

    assert!(engine.toggle_spatial(true));
    assert_ne!(volume(&backend, "left"), volume(&backend, "right"));

    assert!(engine.toggle_spatial(false));
    assert_eq!(engine.phase(), MergePhase::Mirrored);
    assert_eq!(volume(&backend, "left"), volume(&backend, "right"));
}

#[test]
fn test_cleanup_keeps_active_session_and_foreign_aggregates() {
    let (backend, mut engine) = setup();
    assert_eq!(engine.cleanup_orphans(), 0);

    backend
        .create_aggregate(&foreign_aggregate(&format!("{AGGREGATE_UID_PREFIX}STALE")))
        .unwrap();
    backend
        .create_aggregate(&foreign_aggregate("com.apple.aggregate.user"))
        .unwrap();

    // creating the merge sweeps the stale endpoint first
    engine.create_merge(&request("left", "right", false)).unwrap();
    let remaining: Vec<String> = backend.aggregates().into_iter().map(|a| a.uid).collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&"com.apple.aggregate.user".to_string()));
    assert!(!remaining.iter().any(|uid| uid.ends_with("STALE")));

    backend
        .create_aggregate(&foreign_aggregate(&format!("{AGGREGATE_UID_PREFIX}LATE")))
        .unwrap();
    assert_eq!(engine.cleanup_orphans(), 1);
    assert!(engine.is_merge_active());
    assert_eq!(engine.cleanup_orphans(), 0);
}

#[test]
fn test_virtual_endpoint_removal_unmerges() {
    let (backend, mut engine) = setup();
    engine.start_device_monitor().unwrap();
    let virtual_id = engine.create_merge(&request("left", "right", false)).unwrap();
    engine.process_pending();

    backend.destroy_aggregate(virtual_id).unwrap();
    engine.process_pending();
    assert_eq!(engine.phase(), MergePhase::Idle);
    assert_eq!(backend.default_output_uid().as_deref(), Some("speakers"));
}

#[test]
fn test_disconnect_is_ignored_when_disabled() {
    let (backend, mut engine) = setup();
    engine.set_unmerge_on_disconnect(false);
    engine.start_device_monitor().unwrap();
    engine.create_merge(&request("left", "right", false)).unwrap();
    engine.process_pending();

    backend.disconnect("headphones");
    backend.disconnect("right");
    engine.process_pending();
    assert!(engine.is_merge_active());
}
