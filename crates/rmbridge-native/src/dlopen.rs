//! [`LibraryBridge`] – binding to the vendor bridge library via `libloading`.
//!
//! The library exports a flat C ABI. Symbols are resolved once at load time;
//! a missing library or symbol is reported as [`BridgeError::Native`].
//!
//! # Callbacks
//!
//! `UnitySetEventCallback` takes a bare function pointer with no user-data
//! argument, so there is no way to hand the library a reference to the
//! [`CallbackRegistry`]. The binding therefore keeps a weak reference to the
//! bound registry in a process slot that only this module touches, and the
//! exported trampoline upgrades it on every callback. When the registry is
//! dropped, callbacks fall through silently.

use std::ffi::{CStr, CString, c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use libloading::Library;
use rmbridge_types::{BridgeError, EventType};
use tracing::{debug, error, trace, warn};

use crate::native::{CreateOptions, NativeBridge};
use crate::registry::CallbackRegistry;

type CreateFn = unsafe extern "C" fn(name: *const c_char, debuggable: bool, log_path: *const c_char);
type VoidFn = unsafe extern "C" fn();
type InitializeFn = unsafe extern "C" fn() -> bool;
type SendEventFn = unsafe extern "C" fn(event_code: u64, data: *const u8, tag: u64);
type SendEventWithStringFn = unsafe extern "C" fn(event_code: u64, data: *const c_char, tag: u64);
type SendEventWithNumberFn = unsafe extern "C" fn(event_code: u64, data: u64, tag: u64);
type EventCallbackFn = unsafe extern "C" fn(event_code: u64, data: *const u8, len: c_int, tag: u64);
type SetEventCallbackFn = unsafe extern "C" fn(event_code: u64, callback: Option<EventCallbackFn>);
type SecurityKeyFn = unsafe extern "C" fn(index: c_int) -> *mut c_char;

/// Library locations relative to the working directory, keyed by
/// `(target_os, target_arch)`.
const LIBRARY_PATHS: &[((&str, &str), &str)] = &[
    (("android", "arm"), "./lib/android/arm/libunitybridge.so"),
    (("android", "aarch64"), "./lib/android/arm64/libunitybridge.so"),
    (
        ("macos", "x86_64"),
        "./lib/darwin/amd64/unitybridge.bundle/Contents/MacOS/unitybridge",
    ),
    (("ios", "aarch64"), "./Frameworks/unitybridge.framework/unitybridge"),
    (("linux", "x86_64"), "./lib/linux/amd64/libunitybridge.so"),
];

static BOUND_REGISTRY: RwLock<Weak<CallbackRegistry>> = RwLock::new(Weak::new());

/// Default library path for the running platform, if it is supported.
///
/// Relative paths are tried against the working directory first, then
/// against the directory holding the current executable.
pub fn default_library_path() -> Option<PathBuf> {
    let relative = library_path_for(std::env::consts::OS, std::env::consts::ARCH)?;
    let candidate = PathBuf::from(relative);
    if candidate.exists() {
        return Some(candidate);
    }
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(relative)));
    Some(beside_exe.filter(|p| p.exists()).unwrap_or(candidate))
}

fn library_path_for(os: &str, arch: &str) -> Option<&'static str> {
    LIBRARY_PATHS
        .iter()
        .find(|((o, a), _)| *o == os && *a == arch)
        .map(|(_, path)| *path)
}

pub struct LibraryBridge {
    create: CreateFn,
    destroy: VoidFn,
    initialize: InitializeFn,
    uninitialize: VoidFn,
    send_event: SendEventFn,
    send_event_with_string: SendEventWithStringFn,
    send_event_with_number: SendEventWithNumberFn,
    set_event_callback: SetEventCallbackFn,
    security_key: SecurityKeyFn,
    // Keeps every function pointer above valid; dropped last.
    _library: Library,
}

impl LibraryBridge {
    /// Load the library at `path` and resolve every exported primitive.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Native`] if the library cannot be loaded or any symbol
    /// is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initialisers; the vendor library
        // has none with preconditions beyond being loaded once per process.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            BridgeError::Native(format!("could not load bridge library at {}: {e}", path.display()))
        })?;

        // SAFETY: the signatures below match the library's exported C ABI.
        let bridge = unsafe {
            Self {
                create: symbol(&library, "CreateUnityBridge")?,
                destroy: symbol(&library, "DestroyUnityBridge")?,
                initialize: symbol(&library, "UnityBridgeInitialize")?,
                // Exported with this spelling.
                uninitialize: symbol(&library, "UnityBridgeUninitialze")?,
                send_event: symbol(&library, "UnitySendEvent")?,
                send_event_with_string: symbol(&library, "UnitySendEventWithString")?,
                send_event_with_number: symbol(&library, "UnitySendEventWithNumber")?,
                set_event_callback: symbol(&library, "UnitySetEventCallback")?,
                security_key: symbol(&library, "UnityGetSecurityKeyByKeyChainIndex")?,
                _library: library,
            }
        };

        debug!(path = %path.display(), "bridge library loaded");
        Ok(bridge)
    }

    /// Load the library from [`default_library_path`].
    pub fn load_default() -> Result<Self, BridgeError> {
        let path = default_library_path().ok_or_else(|| {
            BridgeError::Native(format!(
                "platform {}/{} is not supported by the bridge library",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
        })?;
        Self::load(path)
    }
}

/// # Safety
///
/// `T` must be the exact function pointer type of the exported symbol.
unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, BridgeError> {
    // SAFETY: forwarded to the caller.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|s| *s)
        .map_err(|e| BridgeError::Native(format!("could not resolve symbol {name}: {e}")))
}

impl NativeBridge for LibraryBridge {
    fn bind(&self, registry: Arc<CallbackRegistry>) {
        bind_registry(&registry);
    }

    fn create(&self, options: &CreateOptions) -> Result<(), BridgeError> {
        let name = CString::new(options.name.as_str())
            .map_err(|e| BridgeError::Native(format!("invalid bridge name: {e}")))?;
        let log_path = CString::new(options.log_path.as_str())
            .map_err(|e| BridgeError::Native(format!("invalid log path: {e}")))?;
        trace!(name = %options.name, debug = options.debug, log_path = %options.log_path, "CreateUnityBridge");
        // SAFETY: both strings outlive the call.
        unsafe { (self.create)(name.as_ptr(), options.debug, log_path.as_ptr()) };
        Ok(())
    }

    fn destroy(&self) {
        trace!("DestroyUnityBridge");
        // SAFETY: no arguments; lifecycle order is enforced by the wrapper.
        unsafe { (self.destroy)() };
    }

    fn initialize(&self) -> Result<(), BridgeError> {
        // SAFETY: no arguments; lifecycle order is enforced by the wrapper.
        let initialized = unsafe { (self.initialize)() };
        trace!(initialized, "UnityBridgeInitialize");
        if initialized {
            Ok(())
        } else {
            Err(BridgeError::Native("bridge library failed to initialise".into()))
        }
    }

    fn uninitialize(&self) {
        trace!("UnityBridgeUninitialze");
        // SAFETY: no arguments; lifecycle order is enforced by the wrapper.
        unsafe { (self.uninitialize)() };
    }

    fn send_event(&self, event_code: u64, data: &[u8], tag: u64) {
        let ptr = if data.is_empty() {
            std::ptr::null()
        } else {
            data.as_ptr()
        };
        trace!(event_code, tag, len = data.len(), "UnitySendEvent");
        // SAFETY: the library copies the payload before returning.
        unsafe { (self.send_event)(event_code, ptr, tag) };
    }

    fn send_event_with_string(&self, event_code: u64, data: &str, tag: u64) {
        let Ok(data) = CString::new(data) else {
            warn!(event_code, tag, "string payload contains NUL; event not sent");
            return;
        };
        trace!(event_code, tag, "UnitySendEventWithString");
        // SAFETY: `data` outlives the call.
        unsafe { (self.send_event_with_string)(event_code, data.as_ptr(), tag) };
    }

    fn send_event_with_number(&self, event_code: u64, data: u64, tag: u64) {
        trace!(event_code, data, tag, "UnitySendEventWithNumber");
        // SAFETY: plain integer arguments.
        unsafe { (self.send_event_with_number)(event_code, data, tag) };
    }

    fn set_event_callback(&self, event_type: EventType, enabled: bool) {
        let code = u64::from(event_type.code()) << 32;
        let callback = enabled.then_some(event_trampoline as EventCallbackFn);
        trace!(%event_type, enabled, "UnitySetEventCallback");
        // SAFETY: the trampoline is a plain `extern "C"` function that lives
        // for the whole process.
        unsafe { (self.set_event_callback)(code, callback) };
    }

    fn security_key(&self, index: u32) -> Option<String> {
        let index = c_int::try_from(index).ok()?;
        // SAFETY: plain integer argument.
        let raw = unsafe { (self.security_key)(index) };
        if raw.is_null() {
            return None;
        }
        // SAFETY: the library returns a NUL-terminated, malloc'd string that
        // the caller owns.
        let key = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { libc::free(raw.cast()) };
        Some(key)
    }
}

impl Drop for LibraryBridge {
    fn drop(&mut self) {
        *BOUND_REGISTRY.write().unwrap_or_else(PoisonError::into_inner) = Weak::new();
    }
}

fn bind_registry(registry: &Arc<CallbackRegistry>) {
    *BOUND_REGISTRY.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(registry);
}

/// Entry point handed to `UnitySetEventCallback` for every enabled type.
extern "C" fn event_trampoline(event_code: u64, data: *const u8, len: c_int, tag: u64) {
    let registry = BOUND_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .upgrade();
    let Some(registry) = registry else {
        return;
    };

    let payload: &[u8] = match usize::try_from(len) {
        Ok(len) if len > 0 && !data.is_null() => {
            // SAFETY: the library guarantees `data` points at `len` readable
            // bytes for the duration of the callback.
            unsafe { std::slice::from_raw_parts(data, len) }
        }
        _ => &[],
    };

    // Unwinding across the C boundary aborts the process.
    if panic::catch_unwind(AssertUnwindSafe(|| registry.dispatch(event_code, payload, tag))).is_err() {
        error!(event_code, tag, "event handler panicked");
    }
}
