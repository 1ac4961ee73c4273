//! Global input event tap abstraction.

use super::keys::{classify, MediaKey, TapEvent, TapVerdict};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Receives swallowed volume keys. Runs on the tap's own thread.
pub type KeySink = Arc<dyn Fn(MediaKey) + Send + Sync>;

/// Event tap error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TapError {
    #[error("Accessibility permission not granted")]
    PermissionDenied,

    #[error("Event tap unavailable: {0}")]
    Unavailable(String),
}

/// A removable, system-wide filter for system-defined input events.
///
/// Implementations feed every event through [`classify`]: swallowed keys go
/// to the installed [`KeySink`], a disabled tap re-enables itself.
pub trait EventTap: Send {
    /// Whether the process already has accessibility permission.
    fn is_trusted(&self) -> bool;

    /// Show the OS permission prompt.
    fn prompt_for_permission(&self);

    fn install(&mut self, sink: KeySink) -> Result<(), TapError>;

    fn uninstall(&mut self);

    fn is_installed(&self) -> bool;
}

/// Stop request for a tap thread whose event loop runs in short slices.
///
/// A request made before the loop starts is still honored.
#[derive(Debug, Clone, Default)]
pub struct TapStop(Arc<AtomicBool>);

impl TapStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Call `slice` repeatedly until a stop is requested.
    pub fn run_until_requested(&self, mut slice: impl FnMut()) {
        while !self.is_requested() {
            slice();
        }
    }
}

#[derive(Default)]
struct TapShared {
    trusted: bool,
    sink: Option<KeySink>,
    enabled: bool,
    prompts: usize,
    reenables: usize,
}

/// In-process [`EventTap`] whose events are injected through a
/// [`SimulatedTapControl`].
pub struct SimulatedTap {
    shared: Arc<Mutex<TapShared>>,
}

/// Test-side handle of a [`SimulatedTap`].
#[derive(Clone)]
pub struct SimulatedTapControl {
    shared: Arc<Mutex<TapShared>>,
}

impl SimulatedTap {
    pub fn new(trusted: bool) -> (Self, SimulatedTapControl) {
        let shared = Arc::new(Mutex::new(TapShared {
            trusted,
            ..TapShared::default()
        }));
        (
            Self {
                shared: shared.clone(),
            },
            SimulatedTapControl { shared },
        )
    }
}

impl EventTap for SimulatedTap {
    fn is_trusted(&self) -> bool {
        self.shared.lock().trusted
    }

    fn prompt_for_permission(&self) {
        self.shared.lock().prompts += 1;
    }

    fn install(&mut self, sink: KeySink) -> Result<(), TapError> {
        let mut shared = self.shared.lock();
        if !shared.trusted {
            return Err(TapError::PermissionDenied);
        }
        shared.sink = Some(sink);
        shared.enabled = true;
        Ok(())
    }

    fn uninstall(&mut self) {
        let mut shared = self.shared.lock();
        shared.sink = None;
        shared.enabled = false;
    }

    fn is_installed(&self) -> bool {
        self.shared.lock().sink.is_some()
    }
}

impl SimulatedTapControl {
    pub fn grant_permission(&self) {
        self.shared.lock().trusted = true;
    }

    pub fn prompts(&self) -> usize {
        self.shared.lock().prompts
    }

    pub fn reenables(&self) -> usize {
        self.shared.lock().reenables
    }

    pub fn is_installed(&self) -> bool {
        self.shared.lock().sink.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    /// Simulate the OS disabling the tap after a slow callback.
    pub fn disable_by_timeout(&self) {
        self.shared.lock().enabled = false;
    }

    /// Feed one event through the tap, as the OS would.
    pub fn deliver(&self, event: TapEvent) -> TapVerdict {
        let sink = {
            let mut shared = self.shared.lock();
            if shared.sink.is_none() {
                return TapVerdict::Pass;
            }
            if !shared.enabled && event != TapEvent::Disabled {
                return TapVerdict::Pass;
            }
            let verdict = classify(event);
            if verdict == TapVerdict::Reenable {
                shared.enabled = true;
                shared.reenables += 1;
                return verdict;
            }
            match verdict {
                TapVerdict::Swallow(key) => shared.sink.clone().map(|sink| (sink, key)),
                _ => return verdict,
            }
        };
        match sink {
            Some((sink, key)) => {
                sink(key);
                TapVerdict::Swallow(key)
            }
            None => TapVerdict::Pass,
        }
    }

    /// Press and release a key.
    pub fn press(&self, key: MediaKey) -> TapVerdict {
        let verdict = self.deliver(TapEvent::media_key(key, true));
        self.deliver(TapEvent::media_key(key, false));
        verdict
    }
}
