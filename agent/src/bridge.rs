//! Calls across the native/managed boundary.
//!
//! The managed runtime is reached through [`ManagedRuntime`]; the default
//! [`DirectRuntime`] calls the C function pointer the embedder registered.
//! Strings crossing the boundary are owned by RAII wrappers so both the
//! argument and the result buffer are released on every path.

use std::ffi::{c_char, CStr, CString};
use std::sync::{Arc, OnceLock};

use core::ffi::c_void;
use log::{debug, error};

use crate::error::BridgeError;
use crate::mutex::MutexRegistry;

/// A zero-argument managed procedure as seen from native code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ManagedCallable {
    pub invoke: Option<unsafe extern "C" fn(user_data: *mut c_void)>,
    pub user_data: *mut c_void,
}

// user_data is opaque to us; the embedder decides which threads may run it.
unsafe impl Send for ManagedCallable {}
unsafe impl Sync for ManagedCallable {}

impl ManagedCallable {
    pub fn is_null(&self) -> bool {
        self.invoke.is_none()
    }
}

pub trait ManagedRuntime: Send + Sync {
    /// Run `callable` on the calling thread and return once it has finished.
    fn invoke(&self, callable: &ManagedCallable) -> Result<(), BridgeError>;
}

/// Calls the callable's function pointer directly.
#[derive(Debug, Default)]
pub struct DirectRuntime;

impl ManagedRuntime for DirectRuntime {
    fn invoke(&self, callable: &ManagedCallable) -> Result<(), BridgeError> {
        let invoke = callable.invoke.ok_or(BridgeError::NullCallable)?;
        unsafe { invoke(callable.user_data) };
        Ok(())
    }
}

/// NUL-terminated buffer allocated by native code and handed back to its
/// release routine on drop.
pub struct NativeString {
    ptr: *mut c_char,
    release: unsafe extern "C" fn(*mut c_char),
}

impl NativeString {
    /// Take ownership of `ptr`; `None` for null.
    ///
    /// # Safety
    /// `ptr` must be a NUL-terminated buffer that `release` frees exactly once.
    pub unsafe fn from_raw(ptr: *mut c_char, release: unsafe extern "C" fn(*mut c_char)) -> Option<Self> {
        (!ptr.is_null()).then_some(Self { ptr, release })
    }

    pub fn to_str(&self) -> Result<&str, BridgeError> {
        unsafe { CStr::from_ptr(self.ptr) }
            .to_str()
            .map_err(|_| BridgeError::InvalidUtf8)
    }
}

impl Drop for NativeString {
    fn drop(&mut self) {
        unsafe { (self.release)(self.ptr) };
    }
}

#[derive(Default)]
pub struct CallBridge {
    runtime: OnceLock<Arc<dyn ManagedRuntime>>,
}

impl CallBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(runtime: Arc<dyn ManagedRuntime>) -> Self {
        let bridge = Self::new();
        bridge.attach_runtime(runtime);
        bridge
    }

    /// Store the runtime handle. Only the first call takes effect.
    pub fn attach_runtime(&self, runtime: Arc<dyn ManagedRuntime>) -> bool {
        self.runtime.set(runtime).is_ok()
    }

    fn runtime(&self) -> &Arc<dyn ManagedRuntime> {
        self.runtime.get_or_init(|| Arc::new(DirectRuntime))
    }

    /// Run a managed procedure synchronously.
    pub fn invoke_and_wait(&self, callable: &ManagedCallable) -> Result<(), BridgeError> {
        if callable.is_null() {
            return Err(BridgeError::NullCallable);
        }
        self.runtime().invoke(callable)
    }

    /// `invoke_and_wait` while holding the registry mutex for `key`.
    pub fn run_locked(&self, registry: &MutexRegistry, key: &str, callable: &ManagedCallable) -> Result<(), BridgeError> {
        registry.run_under_lock(key, || self.invoke_and_wait(callable))
    }

    /// Pass `source` to a native routine and return its string result.
    ///
    /// Marshal failures are logged and produce an empty string.
    pub fn call_with_string<F>(&self, source: &str, routine: F) -> String
    where
        F: FnOnce(&CStr) -> Result<NativeString, BridgeError>,
    {
        match marshal(source, routine) {
            Ok(result) => result,
            Err(e) => {
                error!("string call failed: {e}");
                String::new()
            }
        }
    }
}

fn marshal<F>(source: &str, routine: F) -> Result<String, BridgeError>
where
    F: FnOnce(&CStr) -> Result<NativeString, BridgeError>,
{
    let input = CString::new(source).map_err(|_| BridgeError::InteriorNul)?;
    let output = routine(&input)?;
    let text = output.to_str()?.to_string();
    debug!("string call returned {} bytes", text.len());
    Ok(text)
}

impl std::fmt::Debug for CallBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallBridge")
            .field("runtime_attached", &self.runtime.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::script_engine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C" fn bump(user_data: *mut c_void) {
        (*(user_data as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst);
    }

    fn callable(counter: &AtomicUsize) -> ManagedCallable {
        ManagedCallable {
            invoke: Some(bump),
            user_data: counter as *const AtomicUsize as *mut c_void,
        }
    }

    #[test]
    fn invoke_and_wait_runs_before_returning() {
        let counter = AtomicUsize::new(0);
        let bridge = CallBridge::new();
        bridge.invoke_and_wait(&callable(&counter)).unwrap();
        bridge.invoke_and_wait(&callable(&counter)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn null_callable_is_rejected() {
        let bridge = CallBridge::new();
        let null = ManagedCallable {
            invoke: None,
            user_data: core::ptr::null_mut(),
        };
        assert!(matches!(bridge.invoke_and_wait(&null), Err(BridgeError::NullCallable)));
    }

    #[test]
    fn attached_runtime_is_used_once() {
        struct Counting(AtomicUsize);
        impl ManagedRuntime for Counting {
            fn invoke(&self, _callable: &ManagedCallable) -> Result<(), BridgeError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let runtime = Arc::new(Counting(AtomicUsize::new(0)));
        let bridge = CallBridge::with_runtime(runtime.clone());
        assert!(!bridge.attach_runtime(Arc::new(DirectRuntime)));

        let counter = AtomicUsize::new(0);
        bridge.invoke_and_wait(&callable(&counter)).unwrap();
        assert_eq!(runtime.0.load(Ordering::SeqCst), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn run_locked_holds_the_key() {
        let registry = MutexRegistry::new();
        registry.acquire_for("main.db").unwrap();
        let counter = AtomicUsize::new(0);
        CallBridge::new()
            .run_locked(&registry, "main.db", &callable(&counter))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn call_with_string_releases_result() {
        let _g = crate::test_utils::lock_agent_tests();
        let bridge = CallBridge::new();
        let baseline = script_engine::live_allocations();

        for _ in 0..16 {
            let out = bridge.call_with_string("1+1", |src| unsafe {
                let ptr = script_engine::fake_eval(core::ptr::null_mut(), src.as_ptr(), src.to_bytes().len());
                NativeString::from_raw(ptr, script_engine::fake_release).ok_or(BridgeError::NullResult)
            });
            assert_eq!(out, "2");
        }
        assert_eq!(script_engine::live_allocations(), baseline);
    }

    #[test]
    fn interior_nul_yields_empty_string() {
        let bridge = CallBridge::new();
        let mut called = false;
        let out = bridge.call_with_string("a\0b", |_| {
            called = true;
            Err(BridgeError::NullResult)
        });
        assert_eq!(out, "");
        assert!(!called);
    }

    #[test]
    fn invalid_utf8_result_is_released() {
        let _g = crate::test_utils::lock_agent_tests();
        let baseline = script_engine::live_allocations();
        let out = CallBridge::new().call_with_string("bytes", |_| unsafe {
            let ptr = script_engine::alloc_raw(&[0xff, 0xfe]);
            NativeString::from_raw(ptr, script_engine::fake_release).ok_or(BridgeError::NullResult)
        });
        assert_eq!(out, "");
        assert_eq!(script_engine::live_allocations(), baseline);
    }
}
