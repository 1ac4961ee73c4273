//! Window system access.

use parking_lot::Mutex;
use std::sync::Arc;

/// Invoked when another application becomes frontmost. Runs on an OS thread.
pub type ActivationCallback = Arc<dyn Fn() + Send + Sync>;

/// Rectangle in global display coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn min_x(&self) -> f64 {
        self.x
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn mid_x(&self) -> f64 {
        self.x + self.width / 2.0
    }
}

/// One on-screen window as reported by the window server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowInfo {
    /// Process owning the window
    pub owner_pid: i32,
    /// Window layer, 0 for normal application windows
    pub layer: i32,
    pub bounds: Rect,
}

/// Read access to the frontmost application, its windows and the displays.
pub trait WindowSource: Send {
    /// Process id of the frontmost application.
    fn frontmost_pid(&self) -> Option<i32>;

    /// On-screen windows, front to back, desktop elements excluded.
    fn on_screen_windows(&self) -> Vec<WindowInfo>;

    /// Frames of every connected display.
    fn screen_frames(&self) -> Vec<Rect>;

    /// Register for application activation. Returns false when the platform
    /// cannot deliver activations, in which case polling alone drives updates.
    fn observe_activation(&mut self, callback: ActivationCallback) -> bool;

    fn remove_activation_observer(&mut self);
}

#[derive(Default)]
struct WindowState {
    frontmost: Option<i32>,
    windows: Vec<WindowInfo>,
    screens: Vec<Rect>,
    observer: Option<ActivationCallback>,
}

/// Scriptable [`WindowSource`].
pub struct SimulatedWindows {
    state: Arc<Mutex<WindowState>>,
}

/// Handle used to move windows and switch applications on a [`SimulatedWindows`].
#[derive(Clone)]
pub struct SimulatedWindowControl {
    state: Arc<Mutex<WindowState>>,
}

impl SimulatedWindows {
    /// A source with the given displays and no windows.
    pub fn new(screens: Vec<Rect>) -> (Self, SimulatedWindowControl) {
        let state = Arc::new(Mutex::new(WindowState {
            screens,
            ..WindowState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            SimulatedWindowControl { state },
        )
    }

    /// Two side-by-side 1920x1080 displays.
    pub fn dual_display() -> (Self, SimulatedWindowControl) {
        Self::new(vec![
            Rect::new(0.0, 0.0, 1920.0, 1080.0),
            Rect::new(1920.0, 0.0, 1920.0, 1080.0),
        ])
    }
}

impl WindowSource for SimulatedWindows {
    fn frontmost_pid(&self) -> Option<i32> {
        self.state.lock().frontmost
    }

    fn on_screen_windows(&self) -> Vec<WindowInfo> {
        self.state.lock().windows.clone()
    }

    fn screen_frames(&self) -> Vec<Rect> {
        self.state.lock().screens.clone()
    }

    fn observe_activation(&mut self, callback: ActivationCallback) -> bool {
        self.state.lock().observer = Some(callback);
        true
    }

    fn remove_activation_observer(&mut self) {
        self.state.lock().observer = None;
    }
}

impl SimulatedWindowControl {
    /// Bring `pid` to the front with a single normal window, notifying the
    /// activation observer.
    pub fn activate(&self, pid: i32, bounds: Rect) {
        let observer = {
            let mut state = self.state.lock();
            state.frontmost = Some(pid);
            state.windows.retain(|w| w.owner_pid != pid);
            state.windows.insert(
                0,
                WindowInfo {
                    owner_pid: pid,
                    layer: 0,
                    bounds,
                },
            );
            state.observer.clone()
        };
        if let Some(observer) = observer {
            observer();
        }
    }

    /// Move the frontmost window without an activation.
    pub fn move_front_window(&self, bounds: Rect) {
        let mut state = self.state.lock();
        let Some(pid) = state.frontmost else {
            return;
        };
        if let Some(window) = state.windows.iter_mut().find(|w| w.owner_pid == pid) {
            window.bounds = bounds;
        }
    }

    /// Put an arbitrary window at the front of the stacking order.
    pub fn push_window(&self, window: WindowInfo) {
        self.state.lock().windows.insert(0, window);
    }

    pub fn set_screens(&self, screens: Vec<Rect>) {
        self.state.lock().screens = screens;
    }

    pub fn is_observing(&self) -> bool {
        self.state.lock().observer.is_some()
    }
}
