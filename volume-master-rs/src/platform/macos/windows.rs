//! [`WindowSource`] over the window server.
//!
//! The frontmost application is the owner of the topmost normal-layer window
//! in the window server's front-to-back list, which stays current without an
//! AppKit main run loop.

use crate::window::{frontmost_owner, ActivationCallback, Rect, WindowInfo, WindowSource};
use core_foundation::base::{CFType, TCFType};
use core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
use core_foundation::number::CFNumber;
use core_foundation::string::{CFString, CFStringRef};
use core_graphics::display::CGDisplay;
use core_graphics::geometry::CGRect;
use core_graphics::window::{
    copy_window_info, kCGNullWindowID, kCGWindowBounds, kCGWindowLayer,
    kCGWindowListExcludeDesktopElements, kCGWindowListOptionOnScreenOnly, kCGWindowOwnerPID,
};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// How often the activation watcher samples the frontmost application.
const ACTIVATION_POLL: Duration = Duration::from_millis(100);

struct ActivationWatcher {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
pub struct QuartzWindows {
    watcher: Option<ActivationWatcher>,
}

impl QuartzWindows {
    pub fn new() -> Self {
        Self::default()
    }
}

fn rect_from(frame: CGRect) -> Rect {
    Rect::new(frame.origin.x, frame.origin.y, frame.size.width, frame.size.height)
}

fn key(name: CFStringRef) -> CFString {
    // SAFETY: framework constant, retained by the wrapper
    unsafe { CFString::wrap_under_get_rule(name) }
}

fn integer(entry: &CFDictionary<CFString, CFType>, name: &CFString) -> Option<i64> {
    entry.find(name)?.downcast::<CFNumber>()?.to_i64()
}

fn window_info(entry: &CFDictionary<CFString, CFType>, keys: &[CFString; 3]) -> Option<WindowInfo> {
    let [pid_key, layer_key, bounds_key] = keys;
    let pid = integer(entry, pid_key)?;
    let layer = integer(entry, layer_key)?;
    let bounds = entry.find(bounds_key)?;
    // SAFETY: the bounds entry is a CFDictionary, retained by the wrapper
    let bounds: CFDictionary = unsafe { CFDictionary::wrap_under_get_rule(bounds.as_CFTypeRef() as CFDictionaryRef) };
    let frame = CGRect::from_dict_representation(&bounds)?;
    Some(WindowInfo {
        owner_pid: pid as i32,
        layer: layer as i32,
        bounds: rect_from(frame),
    })
}

/// On-screen windows, front to back.
fn list_windows() -> Vec<WindowInfo> {
    let Some(list) = copy_window_info(
        kCGWindowListOptionOnScreenOnly | kCGWindowListExcludeDesktopElements,
        kCGNullWindowID,
    ) else {
        return Vec::new();
    };
    // SAFETY: reading framework key constants
    let keys = unsafe { [key(kCGWindowOwnerPID), key(kCGWindowLayer), key(kCGWindowBounds)] };

    list.iter()
        .filter_map(|item| {
            // SAFETY: every element is a CFDictionary describing one window
            let entry: CFDictionary<CFString, CFType> =
                unsafe { CFDictionary::wrap_under_get_rule(*item as CFDictionaryRef) };
            window_info(&entry, &keys)
        })
        .collect()
}

impl WindowSource for QuartzWindows {
    fn frontmost_pid(&self) -> Option<i32> {
        frontmost_owner(&list_windows())
    }

    fn on_screen_windows(&self) -> Vec<WindowInfo> {
        list_windows()
    }

    fn screen_frames(&self) -> Vec<Rect> {
        match CGDisplay::active_displays() {
            Ok(displays) => displays
                .into_iter()
                .map(|id| rect_from(CGDisplay::new(id).bounds()))
                .collect(),
            Err(status) => {
                warn!(status, "failed to list displays");
                Vec::new()
            }
        }
    }

    fn observe_activation(&mut self, callback: ActivationCallback) -> bool {
        self.remove_activation_observer();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let spawned = thread::Builder::new()
            .name("frontmost-watcher".into())
            .spawn(move || {
                let mut last = frontmost_owner(&list_windows());
                loop {
                    match stop_rx.recv_timeout(ACTIVATION_POLL) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let current = frontmost_owner(&list_windows());
                    if current != last {
                        last = current;
                        callback();
                    }
                }
            });

        match spawned {
            Ok(thread) => {
                debug!("watching frontmost application");
                self.watcher = Some(ActivationWatcher { stop: stop_tx, thread });
                true
            }
            Err(e) => {
                warn!(error = %e, "activation watcher unavailable");
                false
            }
        }
    }

    fn remove_activation_observer(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.stop.send(());
            if watcher.thread.join().is_err() {
                warn!("activation watcher panicked");
            }
        }
    }
}

impl Drop for QuartzWindows {
    fn drop(&mut self) {
        self.remove_activation_observer();
    }
}
