//! Hook installation on top of the veil-intercept `Interceptor`.
//!
//! Every adapter names the functions it patches as [`HookPoint`]s. Installing
//! an adapter resolves all of its points first, then replaces them one by one
//! and rolls back on the first failure, so an adapter is either fully active
//! or not at all.

pub mod duplex;
pub mod fstat;
pub mod mutex_guard;
pub mod script;
pub mod unary;

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use core::ffi::c_void;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use veil_intercept::module::{find_export_by_name, find_export_in_range, scan_module};
use veil_intercept::{HookError, Interceptor, Signature};

use crate::config::NativeConfig;
use crate::context::NativeContext;
use crate::error::{AgentError, ResolveError};
use crate::locator::TargetModule;

// Thread-local re-entrancy guard. A hook body that ends up calling another
// hooked function (fstat from inside a handler, sqlite from a managed
// callback) must reach the original directly.
thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is inside a hook body. Threads that are
/// tearing down their TLS count as inside.
pub fn is_in_hook() -> bool {
    IN_HOOK.try_with(|h| h.get()).unwrap_or(true)
}

fn set_in_hook(val: bool) {
    let _ = IN_HOOK.try_with(|h| h.set(val));
}

/// RAII guard that marks the current thread as inside a hook body.
/// Nesting-safe: restores the previous state on drop.
pub struct HookSuppressGuard(bool);

impl HookSuppressGuard {
    pub fn new() -> Self {
        let was = is_in_hook();
        set_in_hook(true);
        Self(was)
    }
}

impl Default for HookSuppressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HookSuppressGuard {
    fn drop(&mut self) {
        set_in_hook(self.0);
    }
}

/// Enter a hook body, or `None` when this thread is already inside one.
pub fn enter_hook() -> Option<HookSuppressGuard> {
    if is_in_hook() {
        None
    } else {
        Some(HookSuppressGuard::new())
    }
}

// Replacement functions are bare `extern "C"` and cannot carry a context
// pointer, so the orchestrator publishes it here before patching anything.
static CONTEXT: AtomicPtr<NativeContext> = AtomicPtr::new(core::ptr::null_mut());

pub fn bind_context(ctx: &'static NativeContext) {
    CONTEXT.store(ctx as *const NativeContext as *mut NativeContext, Ordering::Release);
}

pub fn current_context() -> Option<&'static NativeContext> {
    let ptr = CONTEXT.load(Ordering::Acquire);
    // Only ever set from a `&'static NativeContext`.
    unsafe { ptr.as_ref() }
}

/// Embedder pointer carried into handler closures.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForeignData(*mut c_void);

// Opaque to us; the embedder vouches for using it from any thread.
unsafe impl Send for ForeignData {}
unsafe impl Sync for ForeignData {}

impl ForeignData {
    pub(crate) fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub(crate) fn get(self) -> *mut c_void {
        self.0
    }
}

/// Run managed-side decision logic without letting a panic unwind into the
/// patched function's caller.
pub(crate) fn guarded<T>(what: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("{what} handler panicked, forwarding to original");
        fallback
    })
}

/// The signature category of a hooked function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    Duplex,
    FileStatus,
    MutexGuard,
    ScriptEval,
}

impl CallShape {
    pub fn as_str(self) -> &'static str {
        match self {
            CallShape::Unary => "unary",
            CallShape::Duplex => "duplex",
            CallShape::FileStatus => "file-status",
            CallShape::MutexGuard => "mutex-guard",
            CallShape::ScriptEval => "script-eval",
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a unary or duplex handler wants done with an intercepted call.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Forward = 0,
    Cancel = 1,
}

impl Verdict {
    /// Anything other than an explicit cancel forwards.
    pub fn from_raw(raw: u8) -> Self {
        if raw == Verdict::Cancel as u8 {
            Verdict::Cancel
        } else {
            Verdict::Forward
        }
    }
}

/// One installed hook. Kept for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub name: &'static str,
    pub shape: CallShape,
    pub target: usize,
    pub replacement: usize,
    pub trampoline: usize,
}

/// The code-patching primitive the adapters install through.
pub trait InlineHookEngine: Send + Sync {
    /// Redirect `target` to `replacement`, returning a trampoline to the original.
    ///
    /// # Safety
    /// `target` must be a function entry and `replacement` must share its ABI.
    unsafe fn install(&self, target: usize, replacement: usize) -> Result<usize, HookError>;

    fn uninstall(&self, target: usize) -> Result<(), HookError>;
}

impl InlineHookEngine for Interceptor {
    unsafe fn install(&self, target: usize, replacement: usize) -> Result<usize, HookError> {
        self.replace(target as *mut c_void, replacement as *const c_void)
            .map(|trampoline| trampoline as usize)
    }

    fn uninstall(&self, target: usize) -> Result<(), HookError> {
        self.revert(target as *mut c_void)
    }
}

/// How a hook finds its target address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetResolver {
    /// Exported symbol; `module: None` means the target module.
    Symbol {
        #[serde(default)]
        module: Option<String>,
        name: String,
    },
    /// Fixed offset from the target module base.
    Offset { offset: usize },
    /// Byte signature scanned over the readable mappings of the target module.
    Signature {
        pattern: String,
        #[serde(default)]
        offset: isize,
    },
    FirstOf { candidates: Vec<TargetResolver> },
}

impl TargetResolver {
    pub fn symbol(name: &str) -> Self {
        TargetResolver::Symbol {
            module: None,
            name: name.to_string(),
        }
    }

    pub fn symbol_in(module: &str, name: &str) -> Self {
        TargetResolver::Symbol {
            module: Some(module.to_string()),
            name: name.to_string(),
        }
    }

    pub fn resolve(&self, target: &TargetModule) -> Result<usize, ResolveError> {
        match self {
            TargetResolver::Symbol { module: Some(module), name } => Ok(find_export_by_name(module, name)?),
            // The target may have been found through its mappings under a name
            // the loader does not know, so look it up by address instead.
            TargetResolver::Symbol { module: None, name } => {
                Ok(find_export_in_range(target.base, target.size, name)?)
            }
            TargetResolver::Offset { offset } => {
                if *offset >= target.size {
                    return Err(ResolveError::OffsetOutOfRange {
                        offset: *offset,
                        size: target.size,
                    });
                }
                Ok(target.base + offset)
            }
            TargetResolver::Signature { pattern, offset } => {
                let signature = Signature::parse(pattern)?;
                scan_module(&signature, target.base, target.size, &target.path)
                    .map(|found| found.wrapping_add_signed(*offset))
                    .ok_or_else(|| ResolveError::SignatureNotFound(pattern.clone()))
            }
            TargetResolver::FirstOf { candidates } => {
                let mut last = ResolveError::Exhausted;
                for candidate in candidates {
                    match candidate.resolve(target) {
                        Ok(address) => return Ok(address),
                        Err(e) => {
                            debug!("resolver {candidate:?} failed: {e}");
                            last = e;
                        }
                    }
                }
                Err(last)
            }
        }
    }
}

/// Resolution strategy for every hook point.
///
/// The defaults name the exported symbols of the client library and libc;
/// a JSON table (`VEIL_TARGETS`) can override any of them for builds that
/// strip or rename symbols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookTargets {
    pub unary_call: TargetResolver,
    pub duplex_send: TargetResolver,
    pub fstat: TargetResolver,
    pub database_open: TargetResolver,
    pub database_exec: TargetResolver,
    pub script_eval: TargetResolver,
    pub script_release: TargetResolver,
}

impl Default for HookTargets {
    fn default() -> Self {
        Self {
            unary_call: TargetResolver::symbol("grpc_unary_call"),
            duplex_send: TargetResolver::symbol("duplex_stream_send"),
            fstat: TargetResolver::FirstOf {
                candidates: vec![
                    TargetResolver::symbol_in("libc.so", "fstat"),
                    TargetResolver::symbol_in("libc.so.6", "fstat"),
                ],
            },
            database_open: TargetResolver::symbol("sqlite3_open_v2"),
            database_exec: TargetResolver::symbol("sqlite3_exec"),
            script_eval: TargetResolver::symbol("composer_eval_script"),
            script_release: TargetResolver::symbol("composer_free_string"),
        }
    }
}

/// Holds the trampoline (or resolved address) a replacement calls through.
pub struct HookSlot(AtomicUsize);

impl HookSlot {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn set(&self, address: usize) {
        self.0.store(address, Ordering::Release);
    }

    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for HookSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One function an adapter needs.
pub struct HookPoint<'t> {
    pub name: &'static str,
    pub resolver: &'t TargetResolver,
    /// `None` for functions that are only resolved and called, never patched.
    pub replacement: Option<usize>,
    pub slot: &'static HookSlot,
}

pub trait HookAdapter: Sync {
    fn shape(&self) -> CallShape;

    fn enabled(&self, _config: &NativeConfig) -> bool {
        true
    }

    fn points<'t>(&self, targets: &'t HookTargets) -> Vec<HookPoint<'t>>;

    fn install(&self, ctx: &NativeContext, engine: &dyn InlineHookEngine) -> Result<Vec<HookDescriptor>, AgentError> {
        let module = ctx.target().ok_or(AgentError::NoTargetModule)?;
        let points = self.points(&ctx.settings().targets);

        let mut addresses = Vec::with_capacity(points.len());
        for point in &points {
            let address = point
                .resolver
                .resolve(module)
                .map_err(|source| AgentError::Resolve { hook: point.name, source })?;
            addresses.push(address);
        }

        let mut installed: Vec<(HookDescriptor, &'static HookSlot)> = Vec::new();
        for (point, target) in points.iter().zip(addresses) {
            let Some(replacement) = point.replacement else {
                point.slot.set(target);
                continue;
            };
            match unsafe { engine.install(target, replacement) } {
                Ok(trampoline) => {
                    point.slot.set(trampoline);
                    installed.push((
                        HookDescriptor {
                            name: point.name,
                            shape: self.shape(),
                            target,
                            replacement,
                            trampoline,
                        },
                        point.slot,
                    ));
                }
                Err(source) => {
                    for (descriptor, slot) in installed.iter().rev() {
                        if let Err(e) = engine.uninstall(descriptor.target) {
                            error!("rollback of {} failed: {e}", descriptor.name);
                        }
                        slot.clear();
                    }
                    return Err(AgentError::Install { hook: point.name, source });
                }
            }
        }
        Ok(installed.into_iter().map(|(descriptor, _)| descriptor).collect())
    }
}

/// Every adapter, in installation order.
pub fn adapters() -> [&'static dyn HookAdapter; 5] {
    [
        &unary::UnaryAdapter,
        &fstat::FileStatusAdapter,
        &mutex_guard::MutexGuardAdapter,
        &duplex::DuplexAdapter,
        &script::ScriptEvalAdapter,
    ]
}
