//! FFI bindings for the VolumeMaster merge engine.
//!
//! This crate provides C ABI functions for a native settings UI host.
//! All functions use panic::catch_unwind to prevent Rust panics from
//! unwinding across the FFI boundary.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use volume_master_rs::merge::{DisplaySink, VolumeIndicator};
use volume_master_rs::{AudioDevice, EngineHandle, EngineOptions, MergeError, MergeRequest, Platform};

// ============================================================================
// Error Handling
// ============================================================================

/// Error codes returned by FFI functions.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidHandle = -1,
    InvalidArgument = -2,
    DeviceNotFound = -3,
    AlreadyActive = -4,
    SameEndpoint = -5,
    CreationFailed = -6,
    SetDefaultFailed = -7,
    ServiceUnavailable = -8,
    JsonError = -9,
    Panic = -99,
}

impl From<&MergeError> for ErrorCode {
    fn from(err: &MergeError) -> Self {
        match err {
            MergeError::AlreadyActive => ErrorCode::AlreadyActive,
            MergeError::UnknownEndpoint { .. } => ErrorCode::DeviceNotFound,
            MergeError::SameEndpoint => ErrorCode::SameEndpoint,
            MergeError::CreationFailed(_) => ErrorCode::CreationFailed,
            MergeError::SetDefaultFailed(_) => ErrorCode::SetDefaultFailed,
            MergeError::ServiceUnavailable => ErrorCode::ServiceUnavailable,
        }
    }
}

/// Thread-local storage for the last error.
thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, String)>> = const { RefCell::new(None) };
}

fn set_last_error(code: ErrorCode, message: impl Into<String>) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some((code, message.into()));
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Record a merge error and return its code.
fn fail(err: MergeError) -> i32 {
    let code = ErrorCode::from(&err);
    set_last_error(code, err.to_string());
    code as i32
}

// ============================================================================
// Data Types for JSON Serialization
// ============================================================================

/// Configuration for engine creation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Log filter; installs a subscriber when set
    #[serde(default)]
    pub log_level: Option<String>,

    /// Run on in-memory devices instead of the OS audio system
    #[serde(default)]
    pub simulated: bool,

    #[serde(default)]
    pub unmerge_on_disconnect: Option<bool>,
}

/// An output endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct OutputDeviceDto {
    pub id: u32,
    pub uid: String,
    pub name: String,
    pub manufacturer: String,
    pub is_aggregate: bool,
}

impl From<AudioDevice> for OutputDeviceDto {
    fn from(device: AudioDevice) -> Self {
        Self {
            id: device.id,
            is_aggregate: device.is_aggregate(),
            uid: device.uid,
            name: device.name,
            manufacturer: device.manufacturer,
        }
    }
}

/// Response containing a list of devices.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<OutputDeviceDto>,
}

// ============================================================================
// Engine Handle Type
// ============================================================================

/// Opaque handle to the merge engine. Actually points to a VmEngine struct.
pub type VmEngineHandle = *mut c_void;

/// Called with the new volume and mute state (-1 unchanged, 0, 1) after a
/// volume key press. Runs on the engine thread.
pub type VmDisplayCallback = extern "C" fn(volume: f32, mute_state: i32, user_data: *mut c_void);

struct VmEngine {
    engine: EngineHandle,
}

#[derive(Clone, Copy)]
struct DisplayTarget {
    callback: VmDisplayCallback,
    user_data: *mut c_void,
}

// SAFETY: the host guarantees user_data may be used from the engine thread
unsafe impl Send for DisplayTarget {}
unsafe impl Sync for DisplayTarget {}

impl DisplayTarget {
    fn show(&self, indicator: VolumeIndicator) {
        let mute_state = match indicator.muted {
            Some(true) => 1,
            Some(false) => 0,
            None => -1,
        };
        (self.callback)(indicator.volume, mute_state, self.user_data);
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Allocate a C string from a Rust string. Caller must free with vm_engine_free_string.
fn alloc_c_string(s: &str) -> *mut c_char {
    // Interior NUL bytes are dropped
    let bytes: Vec<u8> = s.bytes().filter(|&b| b != 0).collect();
    CString::new(bytes).map_or(ptr::null_mut(), CString::into_raw)
}

/// Parse a C string to a Rust string slice.
unsafe fn parse_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Borrow the engine behind a handle, recording an error for null.
unsafe fn engine_ref<'a>(handle: VmEngineHandle) -> Option<&'a EngineHandle> {
    if handle.is_null() {
        set_last_error(ErrorCode::InvalidHandle, "Null engine handle");
        return None;
    }
    Some(&(*(handle as *const VmEngine)).engine)
}

/// Run an integer-returning call under catch_unwind.
fn guard_i32(what: &str, f: impl FnOnce() -> i32) -> i32 {
    clear_last_error();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => code,
        Err(_) => {
            set_last_error(ErrorCode::Panic, format!("Panic during {what}"));
            ErrorCode::Panic as i32
        }
    }
}

/// Run a JSON-returning call under catch_unwind.
fn guard_json<T: Serialize>(what: &str, f: impl FnOnce() -> Option<T>) -> *mut c_char {
    clear_last_error();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Some(value)) => match serde_json::to_string(&value) {
            Ok(json) => alloc_c_string(&json),
            Err(e) => {
                set_last_error(ErrorCode::JsonError, e.to_string());
                ptr::null_mut()
            }
        },
        Ok(None) => ptr::null_mut(),
        Err(_) => {
            set_last_error(ErrorCode::Panic, format!("Panic during {what}"));
            ptr::null_mut()
        }
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // A host may already have installed a subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

// ============================================================================
// FFI Functions - Lifecycle
// ============================================================================

/// Create a merge engine and start its coordinator thread.
///
/// # Arguments
/// * `config_json` - JSON configuration string (can be null for defaults)
///
/// # Returns
/// Handle to the engine, or null on failure. Check vm_engine_last_error_code() on failure.
///
/// # Safety
/// The returned handle must be freed with vm_engine_destroy().
#[no_mangle]
pub extern "C" fn vm_engine_create(config_json: *const c_char) -> VmEngineHandle {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let config = match unsafe { parse_c_str(config_json) } {
            Some(json) => match serde_json::from_str::<EngineConfig>(json) {
                Ok(config) => config,
                Err(e) => {
                    set_last_error(ErrorCode::JsonError, e.to_string());
                    return ptr::null_mut();
                }
            },
            None => EngineConfig::default(),
        };

        if let Some(level) = &config.log_level {
            init_logging(level);
        }

        let platform = if config.simulated {
            Platform::simulated()
        } else {
            Platform::native()
        };
        let mut options = EngineOptions::default();
        if let Some(enabled) = config.unmerge_on_disconnect {
            options.unmerge_on_disconnect = enabled;
        }

        match EngineHandle::spawn(platform.into_engine(options)) {
            Ok(engine) => {
                tracing::info!(simulated = config.simulated, "merge engine created");
                Box::into_raw(Box::new(VmEngine { engine })) as VmEngineHandle
            }
            Err(e) => {
                set_last_error(ErrorCode::ServiceUnavailable, e.to_string());
                ptr::null_mut()
            }
        }
    });

    match result {
        Ok(handle) => handle,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during engine creation");
            ptr::null_mut()
        }
    }
}

/// Revert the default output, destroy any merge and stop the engine.
///
/// # Safety
/// The handle must have been created by vm_engine_create() and must not be used after this call.
#[no_mangle]
pub extern "C" fn vm_engine_destroy(handle: VmEngineHandle) {
    if handle.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| {
        let engine = unsafe { Box::from_raw(handle as *mut VmEngine) };
        engine.engine.shutdown();
    });
}

// ============================================================================
// FFI Functions - Merge Operations
// ============================================================================

/// Create the merge.
///
/// # Arguments
/// * `handle` - Engine handle
/// * `request_json` - `{"primary_uid", "secondary_uid", "stereo_split", "spatial"}`
///
/// # Returns
/// The virtual endpoint's object id (positive) on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn vm_engine_create_merge(handle: VmEngineHandle, request_json: *const c_char) -> i64 {
    clear_last_error();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(engine) = (unsafe { engine_ref(handle) }) else {
            return ErrorCode::InvalidHandle as i64;
        };
        let Some(json) = (unsafe { parse_c_str(request_json) }) else {
            set_last_error(ErrorCode::InvalidArgument, "Invalid merge request");
            return ErrorCode::InvalidArgument as i64;
        };
        let request: MergeRequest = match serde_json::from_str(json) {
            Ok(request) => request,
            Err(e) => {
                set_last_error(ErrorCode::JsonError, e.to_string());
                return ErrorCode::JsonError as i64;
            }
        };

        match engine.create_merge(request) {
            Ok(id) => i64::from(id),
            Err(e) => i64::from(fail(e)),
        }
    }));

    match result {
        Ok(code) => code,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during create merge");
            ErrorCode::Panic as i64
        }
    }
}

/// Tear down the merge. Succeeds when no merge is active.
///
/// # Returns
/// 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn vm_engine_destroy_merge(handle: VmEngineHandle) -> i32 {
    guard_i32("destroy merge", || {
        let Some(engine) = (unsafe { engine_ref(handle) }) else {
            return ErrorCode::InvalidHandle as i32;
        };
        match engine.destroy_merge() {
            Ok(()) => ErrorCode::Success as i32,
            Err(e) => fail(e),
        }
    })
}

/// Restore the default output that was active before the merge.
///
/// # Returns
/// 1 if the default output was switched back, 0 if there was nothing to
/// revert, negative error code on failure.
#[no_mangle]
pub extern "C" fn vm_engine_revert_default_output(handle: VmEngineHandle) -> i32 {
    guard_i32("revert default output", || {
        let Some(engine) = (unsafe { engine_ref(handle) }) else {
            return ErrorCode::InvalidHandle as i32;
        };
        match engine.revert_default_output() {
            Ok(reverted) => i32::from(reverted),
            Err(e) => fail(e),
        }
    })
}

/// Destroy virtual endpoints left behind by a previous run.
///
/// # Returns
/// Number of endpoints removed, negative error code on failure.
#[no_mangle]
pub extern "C" fn vm_engine_cleanup_orphans(handle: VmEngineHandle) -> i32 {
    guard_i32("cleanup orphans", || {
        let Some(engine) = (unsafe { engine_ref(handle) }) else {
            return ErrorCode::InvalidHandle as i32;
        };
        match engine.cleanup_orphans() {
            Ok(removed) => i32::try_from(removed).unwrap_or(i32::MAX),
            Err(e) => fail(e),
        }
    })
}

/// Switch between mirrored and spatial mode.
///
/// # Arguments
/// * `enabled` - 1 = spatial, 0 = mirrored
///
/// # Returns
/// 1 if the mode changed, 0 if not (no merge, or already in that mode),
/// negative error code on failure.
#[no_mangle]
pub extern "C" fn vm_engine_toggle_spatial(handle: VmEngineHandle, enabled: i32) -> i32 {
    guard_i32("toggle spatial", || {
        let Some(engine) = (unsafe { engine_ref(handle) }) else {
            return ErrorCode::InvalidHandle as i32;
        };
        match engine.toggle_spatial(enabled != 0) {
            Ok(changed) => i32::from(changed),
            Err(e) => fail(e),
        }
    })
}

/// Whether a merge is active. Does not wait on the engine thread.
///
/// # Returns
/// 1 if active, 0 if not, negative error code on failure.
#[no_mangle]
pub extern "C" fn vm_engine_is_merge_active(handle: VmEngineHandle) -> i32 {
    guard_i32("merge state query", || match unsafe { engine_ref(handle) } {
        Some(engine) => i32::from(engine.is_merge_active()),
        None => ErrorCode::InvalidHandle as i32,
    })
}

/// Get the merge status.
///
/// # Returns
/// JSON string. Caller must free with vm_engine_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn vm_engine_get_status(handle: VmEngineHandle) -> *mut c_char {
    guard_json("status", || {
        let engine = unsafe { engine_ref(handle) }?;
        engine
            .status()
            .map_err(|e| {
                fail(e);
            })
            .ok()
    })
}

/// Get the physical output endpoints, own virtual endpoints excluded.
///
/// # Returns
/// JSON string containing the device list. Caller must free with vm_engine_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn vm_engine_get_output_devices(handle: VmEngineHandle) -> *mut c_char {
    guard_json("device enumeration", || {
        let engine = unsafe { engine_ref(handle) }?;
        match engine.output_devices() {
            Ok(devices) => Some(DeviceListResponse {
                devices: devices.into_iter().map(Into::into).collect(),
            }),
            Err(e) => {
                fail(e);
                None
            }
        }
    })
}

/// Register the volume overlay callback. Pass null to remove it.
///
/// # Returns
/// 0 on success, negative error code on failure.
///
/// # Safety
/// `user_data` must stay valid, and usable from another thread, until the
/// callback is replaced or the engine is destroyed.
#[no_mangle]
pub extern "C" fn vm_engine_set_display_callback(
    handle: VmEngineHandle,
    callback: Option<VmDisplayCallback>,
    user_data: *mut c_void,
) -> i32 {
    guard_i32("set display callback", || {
        let Some(engine) = (unsafe { engine_ref(handle) }) else {
            return ErrorCode::InvalidHandle as i32;
        };
        let sink = callback.map(|callback| {
            let target = DisplayTarget { callback, user_data };
            Arc::new(move |indicator: VolumeIndicator| target.show(indicator)) as DisplaySink
        });
        match engine.set_display_sink(sink) {
            Ok(()) => ErrorCode::Success as i32,
            Err(e) => fail(e),
        }
    })
}

// ============================================================================
// FFI Functions - Memory Management
// ============================================================================

/// Free a string allocated by this library.
///
/// # Safety
/// The pointer must have been returned by one of the vm_engine_* functions.
/// Do not call this on strings from other sources.
#[no_mangle]
pub extern "C" fn vm_engine_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    });
}

// ============================================================================
// FFI Functions - Error Handling
// ============================================================================

/// Get the last error code.
///
/// # Returns
/// The error code from the last failed operation, or 0 if no error.
#[no_mangle]
pub extern "C" fn vm_engine_last_error_code() -> i32 {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|(code, _)| *code as i32).unwrap_or(0))
}

/// Get the last error message.
///
/// # Returns
/// Error message string. Caller must free with vm_engine_free_string().
/// Returns null if no error.
#[no_mangle]
pub extern "C" fn vm_engine_last_error_message() -> *mut c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(_, msg)| alloc_c_string(msg))
            .unwrap_or(ptr::null_mut())
    })
}

// ============================================================================
// FFI Functions - Utility
// ============================================================================

/// Get the library version.
///
/// # Returns
/// Version string. Caller must free with vm_engine_free_string().
#[no_mangle]
pub extern "C" fn vm_engine_version() -> *mut c_char {
    alloc_c_string(env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Tests
// ============================================================================
