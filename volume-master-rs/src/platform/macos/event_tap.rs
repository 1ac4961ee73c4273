//! [`EventTap`] over a Quartz session event tap.
//!
//! The tap runs on its own thread with its own run loop, so key handling never
//! waits on the coordinator. The run loop runs in short slices and exits once
//! a stop is requested, including a request made before it first runs.

use crate::input::keys::{classify, TapEvent, TapVerdict, NX_SYSDEFINED};
use crate::input::tap::{EventTap, KeySink, TapError, TapStop};
use accessibility_sys::{kAXTrustedCheckOptionPrompt, AXIsProcessTrusted, AXIsProcessTrustedWithOptions};
use core_foundation::base::TCFType;
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::mach_port::CFMachPort as RunLoopPort;
use core_foundation::runloop::{kCFRunLoopCommonModes, kCFRunLoopDefaultMode, CFRunLoop};
use core_foundation::string::CFString;
use core_foundation_sys::mach_port::CFMachPortInvalidate;
use crossbeam_channel::{bounded, Sender};
use objc2::rc::autoreleasepool;
use objc2_app_kit::NSEvent;
use objc2_core_foundation::{CFMachPort, CFRetained};
use objc2_core_graphics::{
    CGEvent, CGEventTapCreate, CGEventTapEnable, CGEventTapLocation, CGEventTapOptions,
    CGEventTapPlacement, CGEventTapProxy, CGEventType,
};
use std::cell::OnceCell;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest the tap thread stays inside the run loop between stop checks.
const RUN_SLICE: Duration = Duration::from_millis(100);

const TAP_DISABLED_BY_TIMEOUT: u32 = 0xFFFF_FFFE;
const TAP_DISABLED_BY_USER_INPUT: u32 = 0xFFFF_FFFF;

/// Owned by the tap thread; only touched from its run loop.
struct TapContext {
    sink: KeySink,
    port: OnceCell<CFRetained<CFMachPort>>,
}

struct TapThread {
    stop: TapStop,
    thread: JoinHandle<()>,
}

#[derive(Default)]
pub struct QuartzEventTap {
    running: Option<TapThread>,
}

impl QuartzEventTap {
    pub fn new() -> Self {
        Self::default()
    }
}

fn decode(event_type: CGEventType, event: &CGEvent) -> TapEvent {
    if event_type.0 == TAP_DISABLED_BY_TIMEOUT || event_type.0 == TAP_DISABLED_BY_USER_INPUT {
        return TapEvent::Disabled;
    }
    if event_type.0 != NX_SYSDEFINED {
        return TapEvent::Other;
    }
    autoreleasepool(|_| {
        // SAFETY: event is the live CGEvent handed to the callback
        let Some(ns_event) = (unsafe { NSEvent::eventWithCGEvent(event) }) else {
            return TapEvent::Other;
        };
        // SAFETY: system-defined events carry a subtype and data1
        let (subtype, data1) = unsafe { (ns_event.subtype(), ns_event.data1()) };
        TapEvent::SystemDefined {
            subtype: subtype.0,
            data1: data1 as i64,
        }
    })
}

unsafe extern "C-unwind" fn tap_callback(
    _proxy: CGEventTapProxy,
    event_type: CGEventType,
    event: NonNull<CGEvent>,
    user_info: *mut c_void,
) -> *mut CGEvent {
    // SAFETY: user_info is the context owned by the tap thread
    let context = &*(user_info as *const TapContext);
    match classify(decode(event_type, event.as_ref())) {
        TapVerdict::Reenable => {
            if let Some(port) = context.port.get() {
                CGEventTapEnable(port, true);
            }
            debug!("key tap re-enabled");
            event.as_ptr()
        }
        TapVerdict::Swallow(key) => {
            (context.sink)(key);
            ptr::null_mut()
        }
        TapVerdict::Pass => event.as_ptr(),
    }
}

fn run_tap(sink: KeySink, stop: TapStop, ready: Sender<Result<(), TapError>>) {
    let context = Box::new(TapContext {
        sink,
        port: OnceCell::new(),
    });
    let user_info = &*context as *const TapContext as *mut c_void;

    // SAFETY: the context outlives the tap, which is invalidated before it drops
    let port = unsafe {
        CGEventTapCreate(
            CGEventTapLocation::SessionEventTap,
            CGEventTapPlacement::HeadInsertEventTap,
            CGEventTapOptions::Default,
            1u64 << NX_SYSDEFINED,
            Some(tap_callback),
            user_info,
        )
    };
    let Some(port) = port else {
        let _ = ready.send(Err(TapError::Unavailable("CGEventTapCreate returned null".into())));
        return;
    };

    // SAFETY: the same CFMachPort, the wrapper takes its own reference
    let loop_port = unsafe { RunLoopPort::wrap_under_get_rule(CFRetained::as_ptr(&port).as_ptr().cast()) };
    let Ok(source) = loop_port.create_runloop_source(0) else {
        // SAFETY: the port is valid and not yet scheduled
        unsafe { CFMachPortInvalidate(loop_port.as_concrete_TypeRef()) };
        let _ = ready.send(Err(TapError::Unavailable("no run loop source for the tap".into())));
        return;
    };

    let run_loop = CFRunLoop::get_current();
    // SAFETY: reading framework mode constants
    let (common_modes, default_mode) = unsafe { (kCFRunLoopCommonModes, kCFRunLoopDefaultMode) };
    run_loop.add_source(&source, common_modes);
    CGEventTapEnable(&port, true);
    let _ = context.port.set(port);
    let _ = ready.send(Ok(()));

    stop.run_until_requested(|| {
        CFRunLoop::run_in_mode(default_mode, RUN_SLICE, false);
    });

    if let Some(port) = context.port.get() {
        CGEventTapEnable(port, false);
    }
    run_loop.remove_source(&source, common_modes);
    // SAFETY: no callback runs once the port is invalidated
    unsafe { CFMachPortInvalidate(loop_port.as_concrete_TypeRef()) };
    drop(context);
    debug!("key tap thread exiting");
}

impl EventTap for QuartzEventTap {
    fn is_trusted(&self) -> bool {
        // SAFETY: no arguments
        unsafe { AXIsProcessTrusted() }
    }

    fn prompt_for_permission(&self) {
        // SAFETY: framework constant, retained by the wrapper
        let key = unsafe { CFString::wrap_under_get_rule(kAXTrustedCheckOptionPrompt) };
        let options = CFDictionary::from_CFType_pairs(&[(key, CFBoolean::true_value())]);
        // SAFETY: options is a valid dictionary for the call
        unsafe { AXIsProcessTrustedWithOptions(options.as_concrete_TypeRef()) };
    }

    fn install(&mut self, sink: KeySink) -> Result<(), TapError> {
        if self.running.is_some() {
            return Ok(());
        }
        if !self.is_trusted() {
            return Err(TapError::PermissionDenied);
        }

        let stop = TapStop::new();
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name("volume-key-tap".into())
            .spawn(move || run_tap(sink, thread_stop, ready_tx))
            .map_err(|e| TapError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("key tap installed");
                self.running = Some(TapThread { stop, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                warn!("key tap thread exited before reporting");
                let _ = thread.join();
                Err(TapError::Unavailable("tap thread exited".into()))
            }
        }
    }

    fn uninstall(&mut self) {
        let Some(tap) = self.running.take() else {
            return;
        };
        tap.stop.request();
        if tap.thread.join().is_err() {
            warn!("key tap thread panicked");
        }
        info!("key tap removed");
    }

    fn is_installed(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for QuartzEventTap {
    fn drop(&mut self) {
        self.uninstall();
    }
}
