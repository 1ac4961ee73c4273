//! Horizontal position of the focused window.
//!
//! The tracker is polled by the coordinator every [`POLL_INTERVAL`] and on
//! every application activation. It reports a new normalized position only
//! when it moved by more than [`CHANGE_THRESHOLD`] since the last report.

use super::source::{Rect, WindowInfo, WindowSource};
use crate::events::EngineEvent;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Interval between window polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum movement of the normalized position that gets reported.
pub const CHANGE_THRESHOLD: f64 = 0.01;

/// Windows this small or smaller (tooltips, HUDs) are ignored.
const MIN_WINDOW_EXTENT: f64 = 50.0;

/// Position assumed before the first report.
const CENTER: f64 = 0.5;

/// Owner of the topmost normal-layer window in a front-to-back list.
pub fn frontmost_owner(windows: &[WindowInfo]) -> Option<i32> {
    windows.iter().find(|w| w.layer == 0).map(|w| w.owner_pid)
}

/// Bounds of the frontmost normal-layer window owned by `pid`.
pub fn frontmost_window_bounds(windows: &[WindowInfo], pid: i32) -> Option<Rect> {
    windows
        .iter()
        .filter(|w| w.owner_pid == pid && w.layer == 0)
        .map(|w| w.bounds)
        .find(|b| b.width > MIN_WINDOW_EXTENT && b.height > MIN_WINDOW_EXTENT)
}

/// Map `x` onto `[0, 1]` across the union of all display frames.
///
/// Returns the center when there are no displays or they span nothing.
pub fn normalize_x(x: f64, screens: &[Rect]) -> f64 {
    if screens.is_empty() {
        return CENTER;
    }
    let min_x = screens.iter().map(Rect::min_x).fold(f64::INFINITY, f64::min);
    let max_x = screens.iter().map(Rect::max_x).fold(f64::NEG_INFINITY, f64::max);
    let span = max_x - min_x;
    if span <= 0.0 {
        return CENTER;
    }
    ((x - min_x) / span).clamp(0.0, 1.0)
}

pub struct WindowTracker {
    source: Box<dyn WindowSource>,
    last: f64,
    running: bool,
}

impl WindowTracker {
    pub fn new(source: Box<dyn WindowSource>) -> Self {
        Self {
            source,
            last: CENTER,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Last reported position.
    pub fn last_position(&self) -> f64 {
        self.last
    }

    /// Reset to the center, subscribe to activations and poll once.
    ///
    /// Activations are forwarded to the coordinator as
    /// [`EngineEvent::AppActivated`]. Returns the first position if it
    /// differs from the center.
    pub fn start(&mut self, sender: Sender<EngineEvent>) -> Option<f64> {
        self.stop();
        self.last = CENTER;
        self.running = true;

        let observed = self.source.observe_activation(Arc::new(move || {
            let _ = sender.send(EngineEvent::AppActivated);
        }));
        if !observed {
            debug!("activation notifications unavailable, relying on polling");
        }
        self.poll()
    }

    /// Read the frontmost window and report its position if it moved.
    pub fn poll(&mut self) -> Option<f64> {
        if !self.running {
            return None;
        }
        let pid = self.source.frontmost_pid()?;
        let bounds = frontmost_window_bounds(&self.source.on_screen_windows(), pid)?;
        let position = normalize_x(bounds.mid_x(), &self.source.screen_frames());

        if (position - self.last).abs() > CHANGE_THRESHOLD {
            trace!(pid, position, "focused window moved");
            self.last = position;
            Some(position)
        } else {
            None
        }
    }

    /// Stop polling and remove the activation observer.
    pub fn stop(&mut self) {
        if self.running {
            self.source.remove_activation_observer();
            self.running = false;
        }
    }
}

impl Drop for WindowTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_channel;
    use crate::window::source::SimulatedWindows;
    use proptest::prelude::*;

    fn window(pid: i32, layer: i32, bounds: Rect) -> WindowInfo {
        WindowInfo {
            owner_pid: pid,
            layer,
            bounds,
        }
    }

    #[test]
    fn test_small_and_foreign_windows_are_skipped() {
        let windows = [
            window(7, 0, Rect::new(10.0, 10.0, 40.0, 200.0)),
            window(8, 0, Rect::new(0.0, 0.0, 800.0, 600.0)),
            window(7, 3, Rect::new(0.0, 0.0, 800.0, 600.0)),
            window(7, 0, Rect::new(100.0, 0.0, 800.0, 600.0)),
        ];
        assert_eq!(
            frontmost_window_bounds(&windows, 7),
            Some(Rect::new(100.0, 0.0, 800.0, 600.0))
        );
        assert_eq!(frontmost_window_bounds(&windows, 9), None);
    }

    #[test]
    fn test_frontmost_owner_skips_overlay_layers() {
        let windows = [
            window(1, 25, Rect::new(0.0, 0.0, 3840.0, 24.0)),
            window(9, 0, Rect::new(0.0, 0.0, 20.0, 20.0)),
            window(7, 0, Rect::new(100.0, 0.0, 800.0, 600.0)),
        ];
        assert_eq!(frontmost_owner(&windows), Some(9));
        assert_eq!(frontmost_owner(&windows[..1]), None);
        assert_eq!(frontmost_owner(&[]), None);
    }

    #[test]
    fn test_normalize_across_displays() {
        let screens = [
            Rect::new(-1440.0, 0.0, 1440.0, 900.0),
            Rect::new(0.0, 0.0, 1920.0, 1080.0),
        ];
        assert_eq!(normalize_x(-1440.0, &screens), 0.0);
        assert_eq!(normalize_x(1920.0, &screens), 1.0);
        assert!((normalize_x(240.0, &screens) - 0.5).abs() < 1e-9);
        assert_eq!(normalize_x(5000.0, &screens), 1.0);
        assert_eq!(normalize_x(100.0, &[]), 0.5);
        assert_eq!(normalize_x(100.0, &[Rect::new(0.0, 0.0, 0.0, 0.0)]), 0.5);
    }

    #[test]
    fn test_start_polls_and_observes_activation() {
        let (source, control) = SimulatedWindows::dual_display();
        control.activate(1, Rect::new(0.0, 0.0, 400.0, 400.0));
        let mut tracker = WindowTracker::new(Box::new(source));
        let (tx, rx) = create_event_channel();

        let first = tracker.start(tx).unwrap();
        assert!((first - 200.0 / 3840.0).abs() < 1e-9);
        assert!(control.is_observing());

        control.activate(2, Rect::new(3000.0, 0.0, 400.0, 400.0));
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::AppActivated);
        assert!(tracker.poll().unwrap() > 0.8);

        tracker.stop();
        assert!(!control.is_observing());
        assert_eq!(tracker.poll(), None);
    }

    #[test]
    fn test_centered_window_is_not_reported() {
        let (source, control) = SimulatedWindows::dual_display();
        control.activate(1, Rect::new(1720.0, 0.0, 400.0, 400.0));
        let mut tracker = WindowTracker::new(Box::new(source));
        let (tx, _rx) = create_event_channel();
        assert_eq!(tracker.start(tx), None);
    }

    proptest! {
        #[test]
        fn test_jitter_below_threshold_is_ignored(start in 0.0f64..1400.0, jitter in -38.0f64..38.0) {
            let (source, control) = SimulatedWindows::dual_display();
            control.activate(1, Rect::new(start, 0.0, 400.0, 400.0));
            let mut tracker = WindowTracker::new(Box::new(source));
            let (tx, _rx) = create_event_channel();
            prop_assert!(tracker.start(tx).is_some());
            let settled = tracker.last_position();

            // 38 px over a 3840 px span stays under one percent
            control.move_front_window(Rect::new(start + jitter, 0.0, 400.0, 400.0));
            prop_assert_eq!(tracker.poll(), None);
            prop_assert_eq!(tracker.last_position(), settled);
        }
    }
}
