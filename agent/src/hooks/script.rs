//! Embedded script engine (optional, behind `composer_hooks`).
//!
//! The eval hook records the engine context the client evaluates in and runs
//! the registered loader script once per new context. `evaluate_script`
//! later reuses that context through the trampoline.

use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use core::ffi::c_void;
use log::{debug, info, warn};

use super::{current_context, enter_hook, CallShape, HookAdapter, HookPoint, HookSlot, HookTargets};
use crate::bridge::{CallBridge, NativeString};
use crate::config::NativeConfig;
use crate::error::BridgeError;

pub type EvalFn = unsafe extern "C" fn(ctx: *mut c_void, source: *const c_char, len: usize) -> *mut c_char;
pub type ReleaseFn = unsafe extern "C" fn(result: *mut c_char);

pub(crate) static EVAL: HookSlot = HookSlot::new();
pub(crate) static RELEASE: HookSlot = HookSlot::new();

/// Loader source and the engine contexts seen by the eval hook.
#[derive(Debug, Default)]
pub struct ScriptState {
    loader: RwLock<Option<String>>,
    /// Most recent context the client evaluated in.
    engine: AtomicPtr<c_void>,
    /// Contexts the loader already ran in.
    loaded_into: Mutex<HashSet<usize>>,
}

impl ScriptState {
    fn loader(&self) -> RwLockReadGuard<'_, Option<String>> {
        self.loader.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_loader(&self, source: &str) {
        *self.loader.write().unwrap_or_else(|e| e.into_inner()) = Some(source.to_string());
        info!("script loader registered ({} bytes)", source.len());
    }

    pub fn has_loader(&self) -> bool {
        self.loader().is_some()
    }

    pub fn engine(&self) -> *mut c_void {
        self.engine.load(Ordering::Acquire)
    }

    pub(crate) fn capture(&self, engine: *mut c_void) {
        self.engine.store(engine, Ordering::Release);
    }

    /// True exactly once per engine context, and only with a loader set.
    fn needs_loader(&self, engine: *mut c_void) -> bool {
        self.has_loader()
            && self
                .loaded_into
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(engine as usize)
    }
}

fn trampolines() -> Result<(EvalFn, ReleaseFn), BridgeError> {
    match (EVAL.get(), RELEASE.get()) {
        (Some(eval), Some(release)) => unsafe { Ok((core::mem::transmute(eval), core::mem::transmute(release))) },
        _ => Err(BridgeError::NotInstalled),
    }
}

/// Evaluate `source` in `engine` through the original routine.
fn eval_in(engine: *mut c_void, source: &CStr) -> Result<NativeString, BridgeError> {
    let (eval, release) = trampolines()?;
    unsafe {
        let result = eval(engine, source.as_ptr(), source.to_bytes().len());
        NativeString::from_raw(result, release).ok_or(BridgeError::NullResult)
    }
}

unsafe extern "C" fn eval_replacement(engine: *mut c_void, source: *const c_char, len: usize) -> *mut c_char {
    let Some(original) = EVAL.get() else {
        return core::ptr::null_mut();
    };
    let original: EvalFn = core::mem::transmute(original);

    if let (Some(_guard), Some(ctx)) = (enter_hook(), current_context()) {
        let state = ctx.script();
        state.capture(engine);
        if state.needs_loader(engine) {
            let loader = state.loader().clone();
            if let Some(loader) = loader {
                run_loader(engine, &loader);
            }
        }
    }
    original(engine, source, len)
}

fn run_loader(engine: *mut c_void, loader: &str) {
    let Ok(source) = CString::new(loader) else {
        warn!("script loader contains NUL, not loaded");
        return;
    };
    match eval_in(engine, &source) {
        // Dropping the result hands it back to the engine.
        Ok(result) => debug!("loader evaluated in {engine:p}: {:?}", result.to_str().unwrap_or("<binary>")),
        Err(e) => warn!("loader failed in {engine:p}: {e}"),
    }
}

/// Evaluate `source` in the captured engine context and return its result.
pub fn evaluate_script(state: &ScriptState, bridge: &CallBridge, source: &str) -> Result<String, BridgeError> {
    trampolines()?;
    let engine = state.engine();
    if engine.is_null() {
        return Err(BridgeError::NoScriptContext);
    }
    let _guard = super::HookSuppressGuard::new();
    Ok(bridge.call_with_string(source, |src| eval_in(engine, src)))
}

pub struct ScriptEvalAdapter;

impl HookAdapter for ScriptEvalAdapter {
    fn shape(&self) -> CallShape {
        CallShape::ScriptEval
    }

    fn enabled(&self, config: &NativeConfig) -> bool {
        config.composer_hooks
    }

    fn points<'t>(&self, targets: &'t HookTargets) -> Vec<HookPoint<'t>> {
        vec![
            HookPoint {
                name: "script_release",
                resolver: &targets.script_release,
                replacement: None,
                slot: &RELEASE,
            },
            HookPoint {
                name: "script_eval",
                resolver: &targets.script_eval,
                replacement: Some(eval_replacement as *const () as usize),
                slot: &EVAL,
            },
        ]
    }
}
