//! VolumeMaster - Library
//!
//! Merges two physical audio outputs into one virtual output device.
//!
//! ## Features
//!
//! - Create and tear down a multi-output aggregate of two endpoints
//! - Route the system default output to it and restore the previous one
//! - Keep the volume and mute of both endpoints in sync
//! - Stereo split with window-driven left/right balance
//! - Hardware volume keys for outputs without their own volume control
//! - Automatic unmerge when a merged endpoint disconnects
//! - Orphan cleanup of virtual endpoints left by a previous run

pub mod audio;
pub mod config;
pub mod events;
pub mod input;
pub mod merge;
pub mod platform;
pub mod service;
pub mod window;

pub use audio::{AudioBackend, AudioDevice, AudioError, DeviceEnumerator, DeviceEvent};
pub use config::{AppConfig, ConfigError, MergeConfig};
pub use events::EngineEvent;
pub use merge::{
    EngineOptions, MergeEngine, MergeError, MergePhase, MergeRequest, MergeStatus, VolumeIndicator,
};
pub use platform::Platform;
pub use service::EngineHandle;
