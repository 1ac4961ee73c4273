//! Output merging.
//!
//! The [`MergeEngine`] owns the single merge session: the virtual endpoint
//! combining two physical outputs, and whichever balancing strategy keeps
//! those outputs in step ([`MirrorEngine`] or [`SpatialBalancer`]).

pub mod engine;
pub mod mirror;
pub mod spatial;

pub use engine::{EngineOptions, MergeEngine};
pub use mirror::MirrorEngine;
pub use spatial::{Balance, SpatialBalancer, GAIN_FLOOR};

use crate::audio::device::AudioError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Display name of the virtual endpoint.
pub const VIRTUAL_DEVICE_NAME: &str = "VolumeMaster Multi-Output";

/// Time the OS needs to bring a new aggregate up before it can be configured.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Stereo pair of a stacked two-device aggregate: first channel of each member.
pub const SPLIT_STEREO_CHANNELS: [u32; 2] = [1, 3];

/// Merge engine error types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("A merge is already active")]
    AlreadyActive,

    #[error("Unknown output endpoint: {uid}")]
    UnknownEndpoint { uid: String },

    #[error("Primary and secondary endpoints must differ")]
    SameEndpoint,

    #[error("Virtual endpoint creation failed with status {0}")]
    CreationFailed(i32),

    #[error("Could not make the virtual endpoint the default output: {0}")]
    SetDefaultFailed(AudioError),

    #[error("Merge service is not running")]
    ServiceUnavailable,
}

/// Merge session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    /// No merge
    Idle,
    /// Merge up, primary volume mirrored onto the secondary
    Mirrored,
    /// Merge up, gains follow the focused window
    Spatial,
    /// Switching modes
    Transitioning,
}

impl MergePhase {
    pub fn is_active(self) -> bool {
        !matches!(self, MergePhase::Idle)
    }
}

/// State of the volume key tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTapState {
    Inactive,
    Installed,
    /// Waiting for accessibility permission, retried every second
    AwaitingPermission,
}

/// Parameters of a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MergeRequest {
    pub primary_uid: String,
    pub secondary_uid: String,
    /// Stack the two outputs as left and right instead of mirroring audio
    #[serde(default)]
    pub stereo_split: bool,
    /// Start in spatial mode (only honored with `stereo_split`)
    #[serde(default)]
    pub spatial: bool,
}

/// Snapshot of the merge state for collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeStatus {
    pub phase: MergePhase,
    pub primary_uid: Option<String>,
    pub secondary_uid: Option<String>,
    pub virtual_uid: Option<String>,
    pub stereo_split: bool,
    pub spatial: bool,
    pub key_tap: KeyTapState,
}

/// Value shown by the volume overlay after a key press.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeIndicator {
    pub volume: f32,
    /// Present when the key changed the mute state
    pub muted: Option<bool>,
}

/// Best-effort receiver of [`VolumeIndicator`] updates.
pub type DisplaySink = Arc<dyn Fn(VolumeIndicator) + Send + Sync>;
