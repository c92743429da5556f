//! Exported C ABI.
//!
//! The managed side links against these symbols. Every export catches panics
//! and reports failure through its return value; nothing unwinds into the
//! caller's frames.

use std::ffi::{c_char, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use core::ffi::c_void;
use log::{debug, error, info, warn};
use veil_intercept::Interceptor;

use crate::bridge::ManagedCallable;
use crate::config::{AgentSettings, NativeConfig, NativeConfigRecord};
use crate::context::NativeContext;
use crate::hooks::{duplex, script, unary};
use crate::locator::ProcessModules;
use crate::orchestrator;

/// Receives borrowed result bytes; the buffer is only valid during the call.
pub type StringSink = unsafe extern "C" fn(data: *const c_char, len: usize, user_data: *mut c_void);

pub type UnaryCallback =
    unsafe extern "C" fn(uri: *const c_char, data: *const u8, len: usize, user_data: *mut c_void) -> u8;

pub type DuplexCallback = unsafe extern "C" fn(stream: usize, data: *const u8, len: usize, user_data: *mut c_void) -> u8;

static CONTEXT: OnceLock<NativeContext> = OnceLock::new();

/// The process-wide context, built from the environment on first use.
pub fn context() -> &'static NativeContext {
    CONTEXT.get_or_init(|| NativeContext::new(AgentSettings::from_env()))
}

fn ffi_guard<T>(name: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("{name} panicked");
        fallback
    })
}

unsafe fn borrowed_str<'a>(ptr: *const c_char, what: &str) -> Option<&'a str> {
    if ptr.is_null() {
        warn!("{what}: null string");
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            warn!("{what}: string is not UTF-8");
            None
        }
    }
}

/// Process attach: logging, context, remapper armed with the owner identifier.
pub fn attach() {
    let _ = env_logger::try_init();
    let ctx = context();
    if ctx.settings().skip_remap {
        return;
    }
    let owner = ctx.settings().owner_id.clone();
    if ctx.remapper().arm(&owner) {
        debug!("section remapper armed for {owner}");
    }
}

/// Locate the client library, install hooks and remap sections. Idempotent.
#[unsafe(no_mangle)]
pub extern "C" fn veil_initialize() -> bool {
    ffi_guard("veil_initialize", false, || {
        orchestrator::initialize(context(), &ProcessModules, Interceptor::obtain())
    })
}

/// Copy configuration flags from the managed side. Ignored after initialization.
#[unsafe(no_mangle)]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn veil_load_config(record: *const NativeConfigRecord) {
    ffi_guard("veil_load_config", (), || {
        let Some(record) = (unsafe { record.as_ref() }) else {
            warn!("veil_load_config: null record");
            return;
        };
        let config = NativeConfig::from(*record);
        if context().load_config(config) {
            info!("config loaded: {config:?}");
        }
    })
}

#[unsafe(no_mangle)]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn veil_load_config_json(json: *const c_char) -> bool {
    ffi_guard("veil_load_config_json", false, || {
        let Some(json) = (unsafe { borrowed_str(json, "veil_load_config_json") }) else {
            return false;
        };
        match NativeConfig::from_json(json) {
            Ok(config) => context().load_config(config),
            Err(e) => {
                warn!("invalid config: {e}");
                false
            }
        }
    })
}

/// Run `action` while holding the mutex registered for `key`.
#[unsafe(no_mangle)]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn veil_lock_resource(key: *const c_char, action: ManagedCallable) {
    ffi_guard("veil_lock_resource", (), || {
        let Some(key) = (unsafe { borrowed_str(key, "veil_lock_resource") }) else {
            return;
        };
        let ctx = context();
        if let Err(e) = ctx.bridge().run_locked(ctx.registry(), key, &action) {
            warn!("lock_resource({key}): {e}");
        }
    })
}

/// Register the script evaluated once in every new engine context.
#[unsafe(no_mangle)]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn veil_set_script_loader(identifier: *const c_char) {
    ffi_guard("veil_set_script_loader", (), || {
        if let Some(source) = unsafe { borrowed_str(identifier, "veil_set_script_loader") } {
            context().script().set_loader(source);
        }
    })
}

/// Evaluate `source` in the captured engine context and hand the result to `sink`.
#[unsafe(no_mangle)]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn veil_evaluate_script(source: *const c_char, sink: Option<StringSink>, user_data: *mut c_void) -> bool {
    ffi_guard("veil_evaluate_script", false, || {
        let Some(source) = (unsafe { borrowed_str(source, "veil_evaluate_script") }) else {
            return false;
        };
        let ctx = context();
        match script::evaluate_script(ctx.script(), ctx.bridge(), source) {
            Ok(result) => {
                if let Some(sink) = sink {
                    unsafe { sink(result.as_ptr() as *const c_char, result.len(), user_data) };
                }
                true
            }
            Err(e) => {
                warn!("evaluate_script: {e}");
                false
            }
        }
    })
}

/// Install (or with a null callback, remove) the unary call handler.
#[unsafe(no_mangle)]
pub extern "C" fn veil_set_unary_handler(callback: Option<UnaryCallback>, user_data: *mut c_void) {
    ffi_guard("veil_set_unary_handler", (), || {
        context().set_unary_handler(callback.map(|cb| unary::foreign_handler(cb, user_data)));
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn veil_set_duplex_handler(callback: Option<DuplexCallback>, user_data: *mut c_void) {
    ffi_guard("veil_set_duplex_handler", (), || {
        context().set_duplex_handler(callback.map(|cb| duplex::foreign_handler(cb, user_data)));
    })
}

/// Constructor for automatic attach on library load.
#[cfg(all(linux_like, not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        ffi_guard("attach", (), attach);
    }
    init
};
