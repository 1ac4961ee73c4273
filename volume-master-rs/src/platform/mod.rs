//! Platform selection.
//!
//! Bundles the audio backend, key tap and window source the engine runs on:
//! the native macOS implementations, or in-memory ones for other systems and
//! for demos.

#[cfg(target_os = "macos")]
pub mod macos;

use crate::audio::property::AudioBackend;
use crate::audio::simulated::SimulatedBackend;
use crate::input::tap::{EventTap, SimulatedTap};
use crate::merge::{EngineOptions, MergeEngine};
use crate::window::{SimulatedWindows, WindowSource};
use std::sync::Arc;

/// The three OS seams of a [`MergeEngine`].
pub struct Platform {
    pub name: &'static str,
    pub backend: Arc<dyn AudioBackend>,
    pub tap: Box<dyn EventTap>,
    pub windows: Box<dyn WindowSource>,
}

impl Platform {
    /// Native implementations where available, simulated otherwise.
    pub fn native() -> Self {
        #[cfg(target_os = "macos")]
        {
            Self {
                name: "coreaudio",
                backend: Arc::new(macos::CoreAudioBackend::new()),
                tap: Box::new(macos::QuartzEventTap::new()),
                windows: Box::new(macos::QuartzWindows::new()),
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            tracing::warn!("no native audio backend on this platform, using simulated devices");
            Self::simulated()
        }
    }

    /// Demo devices, a trusted key tap and two side-by-side displays.
    pub fn simulated() -> Self {
        let (tap, _tap_control) = SimulatedTap::new(true);
        let (windows, _window_control) = SimulatedWindows::dual_display();
        Self {
            name: "simulated",
            backend: Arc::new(SimulatedBackend::with_demo_devices()),
            tap: Box::new(tap),
            windows: Box::new(windows),
        }
    }

    /// Build an engine on these seams.
    pub fn into_engine(self, options: EngineOptions) -> MergeEngine {
        MergeEngine::new(self.backend, self.tap, self.windows, options)
    }
}
