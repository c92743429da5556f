//! Unary RPC calls: `fn(channel, uri, request, options) -> response`.
//!
//! The registered handler sees the method URI and the serialized request and
//! may cancel the call, in which case the caller gets a null response.

use std::ffi::{c_char, CStr};
use std::sync::Arc;

use core::ffi::c_void;
use log::{debug, warn};

use super::{current_context, enter_hook, guarded, CallShape, HookAdapter, HookPoint, HookSlot, HookTargets, Verdict};

/// Request payload as laid out by the client library.
#[repr(C)]
#[derive(Debug)]
pub struct NativeBuffer {
    pub data: *const u8,
    pub len: usize,
}

impl NativeBuffer {
    /// # Safety
    /// `data` must point at `len` readable bytes (or be null).
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.data.is_null() || self.len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.data, self.len)
        }
    }
}

pub type UnaryCallFn = unsafe extern "C" fn(
    channel: *mut c_void,
    uri: *const c_char,
    request: *mut NativeBuffer,
    options: *mut c_void,
) -> *mut c_void;

/// Decides whether a unary call goes through, given `(uri, payload)`.
pub type UnaryHandler = Arc<dyn Fn(&str, &[u8]) -> Verdict + Send + Sync>;

pub(crate) static ORIGINAL: HookSlot = HookSlot::new();

unsafe extern "C" fn unary_call_replacement(
    channel: *mut c_void,
    uri: *const c_char,
    request: *mut NativeBuffer,
    options: *mut c_void,
) -> *mut c_void {
    let Some(original) = ORIGINAL.get() else {
        // Only reachable between patching and publishing the trampoline.
        return core::ptr::null_mut();
    };
    let original: UnaryCallFn = core::mem::transmute(original);

    if let Some(_guard) = enter_hook() {
        if decide(uri, request) == Verdict::Cancel {
            return core::ptr::null_mut();
        }
    }
    original(channel, uri, request, options)
}

unsafe fn decide(uri: *const c_char, request: *const NativeBuffer) -> Verdict {
    let Some(handler) = current_context().and_then(|ctx| ctx.unary_handler()) else {
        return Verdict::Forward;
    };
    if uri.is_null() {
        return Verdict::Forward;
    }
    let uri = CStr::from_ptr(uri).to_string_lossy();
    let payload = request.as_ref().map(|r| r.as_slice()).unwrap_or(&[]);

    let verdict = guarded("unary", Verdict::Forward, || handler(&*uri, payload));
    if verdict == Verdict::Cancel {
        debug!("unary call {uri} cancelled");
    }
    verdict
}

pub struct UnaryAdapter;

impl HookAdapter for UnaryAdapter {
    fn shape(&self) -> CallShape {
        CallShape::Unary
    }

    fn points<'t>(&self, targets: &'t HookTargets) -> Vec<HookPoint<'t>> {
        vec![HookPoint {
            name: "unary_call",
            resolver: &targets.unary_call,
            replacement: Some(unary_call_replacement as *const () as usize),
            slot: &ORIGINAL,
        }]
    }
}

/// Handler backed by a C callback returning a raw [`Verdict`].
pub fn foreign_handler(
    callback: unsafe extern "C" fn(uri: *const c_char, data: *const u8, len: usize, user_data: *mut c_void) -> u8,
    user_data: *mut c_void,
) -> UnaryHandler {
    let user_data = super::ForeignData::new(user_data);
    Arc::new(move |uri: &str, payload: &[u8]| {
        let Ok(uri) = std::ffi::CString::new(uri) else {
            warn!("unary uri contains NUL, forwarding");
            return Verdict::Forward;
        };
        let raw = unsafe { callback(uri.as_ptr(), payload.as_ptr(), payload.len(), user_data.get()) };
        Verdict::from_raw(raw)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{leak_context, lock_agent_tests};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    static ORIGINAL_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn fake_unary(
        _channel: *mut c_void,
        _uri: *const c_char,
        request: *mut NativeBuffer,
        _options: *mut c_void,
    ) -> *mut c_void {
        ORIGINAL_CALLS.fetch_add(1, Ordering::SeqCst);
        request as *mut c_void
    }

    fn call(uri: &CStr, payload: &[u8]) -> *mut c_void {
        let mut request = NativeBuffer {
            data: payload.as_ptr(),
            len: payload.len(),
        };
        unsafe { unary_call_replacement(core::ptr::null_mut(), uri.as_ptr(), &mut request, core::ptr::null_mut()) }
    }

    #[test]
    fn handler_can_cancel_or_forward() {
        let _g = lock_agent_tests();
        ORIGINAL.set(fake_unary as *const () as usize);
        let ctx = leak_context();
        super::super::bind_context(ctx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        ctx.set_unary_handler(Some(Arc::new(move |uri: &str, payload: &[u8]| {
            log.lock().unwrap().push((uri.to_string(), payload.to_vec()));
            if uri.ends_with("/Track") {
                Verdict::Cancel
            } else {
                Verdict::Forward
            }
        })));

        let before = ORIGINAL_CALLS.load(Ordering::SeqCst);
        assert!(call(c"/snap.Metrics/Track", b"abc").is_null());
        assert!(!call(c"/snap.Messaging/Send", b"hi").is_null());
        assert_eq!(ORIGINAL_CALLS.load(Ordering::SeqCst), before + 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("/snap.Metrics/Track".to_string(), b"abc".to_vec()));
        assert_eq!(seen[1].0, "/snap.Messaging/Send");

        ctx.set_unary_handler(None);
        ORIGINAL.clear();
    }

    #[test]
    fn panicking_handler_forwards() {
        let _g = lock_agent_tests();
        ORIGINAL.set(fake_unary as *const () as usize);
        let ctx = leak_context();
        super::super::bind_context(ctx);
        ctx.set_unary_handler(Some(Arc::new(|_: &str, _: &[u8]| -> Verdict { panic!("handler bug") })));

        assert!(!call(c"/any", b"").is_null());

        ctx.set_unary_handler(None);
        ORIGINAL.clear();
    }

    #[test]
    fn nested_call_skips_handler() {
        let _g = lock_agent_tests();
        ORIGINAL.set(fake_unary as *const () as usize);
        let ctx = leak_context();
        super::super::bind_context(ctx);
        ctx.set_unary_handler(Some(Arc::new(|_: &str, _: &[u8]| Verdict::Cancel)));

        let _outer = super::super::HookSuppressGuard::new();
        assert!(!call(c"/any", b"x").is_null());

        ctx.set_unary_handler(None);
        ORIGINAL.clear();
    }

    unsafe extern "C" fn cancel_when_payload_starts_with_x(
        _uri: *const c_char,
        data: *const u8,
        len: usize,
        user_data: *mut c_void,
    ) -> u8 {
        (*(user_data as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst);
        (len > 0 && *data == b'x') as u8
    }

    #[test]
    fn foreign_handler_passes_bytes_through() {
        let calls = AtomicUsize::new(0);
        let handler = foreign_handler(
            cancel_when_payload_starts_with_x,
            &calls as *const AtomicUsize as *mut c_void,
        );
        assert_eq!(handler("/a", b"xyz"), Verdict::Cancel);
        assert_eq!(handler("/a", b"abc"), Verdict::Forward);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
