//! Messages written to a bidirectional stream: `fn(stream, message, len) -> status`.

use std::ffi::c_int;
use std::sync::Arc;

use core::ffi::c_void;
use log::debug;

use super::{current_context, enter_hook, guarded, CallShape, HookAdapter, HookPoint, HookSlot, HookTargets, Verdict};

pub type DuplexSendFn = unsafe extern "C" fn(stream: *mut c_void, message: *const u8, len: usize) -> c_int;

/// Decides whether a message is written, given `(stream id, message)`.
pub type DuplexHandler = Arc<dyn Fn(usize, &[u8]) -> Verdict + Send + Sync>;

pub(crate) static ORIGINAL: HookSlot = HookSlot::new();

unsafe extern "C" fn duplex_send_replacement(stream: *mut c_void, message: *const u8, len: usize) -> c_int {
    let Some(original) = ORIGINAL.get() else {
        return -1;
    };
    let original: DuplexSendFn = core::mem::transmute(original);

    if let Some(_guard) = enter_hook() {
        if let Some(handler) = current_context().and_then(|ctx| ctx.duplex_handler()) {
            let bytes = if message.is_null() {
                &[][..]
            } else {
                std::slice::from_raw_parts(message, len)
            };
            let verdict = guarded("duplex", Verdict::Forward, || handler(stream as usize, bytes));
            if verdict == Verdict::Cancel {
                // Dropped messages look delivered to the caller.
                debug!("duplex message on {stream:p} dropped ({len} bytes)");
                return 0;
            }
        }
    }
    original(stream, message, len)
}

pub struct DuplexAdapter;

impl HookAdapter for DuplexAdapter {
    fn shape(&self) -> CallShape {
        CallShape::Duplex
    }

    fn points<'t>(&self, targets: &'t HookTargets) -> Vec<HookPoint<'t>> {
        vec![HookPoint {
            name: "duplex_send",
            resolver: &targets.duplex_send,
            replacement: Some(duplex_send_replacement as *const () as usize),
            slot: &ORIGINAL,
        }]
    }
}

/// Handler backed by a C callback returning a raw [`Verdict`].
pub fn foreign_handler(
    callback: unsafe extern "C" fn(stream: usize, data: *const u8, len: usize, user_data: *mut c_void) -> u8,
    user_data: *mut c_void,
) -> DuplexHandler {
    let user_data = super::ForeignData::new(user_data);
    Arc::new(move |stream: usize, message: &[u8]| {
        Verdict::from_raw(unsafe { callback(stream, message.as_ptr(), message.len(), user_data.get()) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{leak_context, lock_agent_tests};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SENT_BYTES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn fake_send(_stream: *mut c_void, _message: *const u8, len: usize) -> c_int {
        SENT_BYTES.fetch_add(len, Ordering::SeqCst);
        7
    }

    fn send(stream: usize, message: &[u8]) -> c_int {
        unsafe { duplex_send_replacement(stream as *mut c_void, message.as_ptr(), message.len()) }
    }

    #[test]
    fn cancelled_message_reports_success_without_sending() {
        let _g = lock_agent_tests();
        ORIGINAL.set(fake_send as *const () as usize);
        let ctx = leak_context();
        super::super::bind_context(ctx);
        ctx.set_duplex_handler(Some(Arc::new(|stream: usize, message: &[u8]| {
            if stream == 0x20 && message.starts_with(b"typing") {
                Verdict::Cancel
            } else {
                Verdict::Forward
            }
        })));

        let before = SENT_BYTES.load(Ordering::SeqCst);
        assert_eq!(send(0x20, b"typing..."), 0);
        assert_eq!(SENT_BYTES.load(Ordering::SeqCst), before);

        assert_eq!(send(0x20, b"hello"), 7);
        assert_eq!(send(0x30, b"typing"), 7);
        assert_eq!(SENT_BYTES.load(Ordering::SeqCst), before + 11);

        ctx.set_duplex_handler(None);
        ORIGINAL.clear();
    }

    #[test]
    fn no_handler_forwards() {
        let _g = lock_agent_tests();
        ORIGINAL.set(fake_send as *const () as usize);
        super::super::bind_context(leak_context());

        assert_eq!(send(1, b"abc"), 7);

        ORIGINAL.clear();
    }

    #[test]
    fn missing_trampoline_fails_the_write() {
        let _g = lock_agent_tests();
        ORIGINAL.clear();
        assert_eq!(send(1, b"abc"), -1);
    }
}
