//! Frontmost window position tracking.

pub mod source;
pub mod tracker;

pub use source::{ActivationCallback, Rect, SimulatedWindowControl, SimulatedWindows, WindowInfo, WindowSource};
pub use tracker::{frontmost_owner, WindowTracker, CHANGE_THRESHOLD, POLL_INTERVAL};
