//! Shared test utilities for the agent crate.

use std::sync::{Mutex, MutexGuard};

use veil_intercept::{HookError, ModuleInfo};

use crate::config::AgentSettings;
use crate::context::NativeContext;
use crate::hooks::{HookTargets, InlineHookEngine, TargetResolver};
use crate::locator::{ModuleTable, TargetModule};

static AGENT_TESTS: Mutex<()> = Mutex::new(());

/// Serialize tests that touch process-wide hook state (bound context,
/// trampoline slots, fake engine counters).
pub fn lock_agent_tests() -> MutexGuard<'static, ()> {
    AGENT_TESTS.lock().unwrap_or_else(|e| e.into_inner())
}

/// Every hook point at a distinct offset inside a 0x1000 byte module.
pub fn offset_targets() -> HookTargets {
    HookTargets {
        unary_call: TargetResolver::Offset { offset: 0x100 },
        duplex_send: TargetResolver::Offset { offset: 0x200 },
        fstat: TargetResolver::Offset { offset: 0x300 },
        database_open: TargetResolver::Offset { offset: 0x400 },
        database_exec: TargetResolver::Offset { offset: 0x500 },
        script_eval: TargetResolver::Offset { offset: 0x600 },
        script_release: TargetResolver::Offset { offset: 0x700 },
    }
}

pub fn leak(settings: AgentSettings) -> &'static NativeContext {
    Box::leak(Box::new(NativeContext::new(settings)))
}

pub fn leak_context() -> &'static NativeContext {
    leak(
        AgentSettings {
            skip_remap: true,
            ..AgentSettings::default()
        }
        .with_targets(offset_targets()),
    )
}

pub fn leak_context_with_target(module: TargetModule) -> &'static NativeContext {
    let ctx = leak_context();
    ctx.set_target(module);
    ctx
}

/// A zeroed, writable block standing in for a loaded module. Heap memory is
/// not file-backed, so the path is empty.
pub fn code_module(size: usize) -> TargetModule {
    let bytes: &'static mut [u8] = Box::leak(vec![0u8; size].into_boxed_slice());
    TargetModule {
        name: "libfake.so".into(),
        path: String::new(),
        base: bytes.as_mut_ptr() as usize,
        size,
    }
}

/// Module table backed by a fixed list; remembers which names were asked for.
#[derive(Default)]
pub struct FakeModuleTable {
    modules: Vec<ModuleInfo>,
    consulted: Mutex<Vec<String>>,
}

impl FakeModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, base: usize, size: usize) -> Self {
        self.modules.push(ModuleInfo {
            name: name.to_string(),
            path: format!("/data/app/lib/{name}"),
            base_address: base,
            size,
        });
        self
    }

    pub fn consulted(&self) -> Vec<String> {
        self.consulted.lock().unwrap().clone()
    }
}

impl ModuleTable for FakeModuleTable {
    fn find(&self, name: &str) -> Option<ModuleInfo> {
        self.consulted.lock().unwrap().push(name.to_string());
        self.modules.iter().find(|m| m.name == name).cloned()
    }
}

/// Hook engine that patches nothing and records what it was asked to do.
pub struct RecordingEngine {
    fail_after: Option<usize>,
    installs: Mutex<Vec<(usize, usize)>>,
    active: Mutex<Vec<usize>>,
}

impl RecordingEngine {
    pub const TRAMPOLINE_BIAS: usize = 0x1000_0000;

    pub fn new() -> Self {
        Self {
            fail_after: None,
            installs: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Succeed `n` times, then refuse every install.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new()
        }
    }

    /// Every successful install as `(target, replacement)`, including reverted ones.
    pub fn installs(&self) -> Vec<(usize, usize)> {
        self.installs.lock().unwrap().clone()
    }

    /// Targets currently patched.
    pub fn active(&self) -> Vec<usize> {
        self.active.lock().unwrap().clone()
    }
}

impl InlineHookEngine for RecordingEngine {
    unsafe fn install(&self, target: usize, replacement: usize) -> Result<usize, HookError> {
        let mut installs = self.installs.lock().unwrap();
        if self.fail_after.is_some_and(|n| installs.len() >= n) {
            return Err(HookError::RelocationFailed);
        }
        installs.push((target, replacement));
        self.active.lock().unwrap().push(target);
        Ok(target + Self::TRAMPOLINE_BIAS)
    }

    fn uninstall(&self, target: usize) -> Result<(), HookError> {
        let mut active = self.active.lock().unwrap();
        match active.iter().position(|t| *t == target) {
            Some(i) => {
                active.remove(i);
                Ok(())
            }
            None => Err(HookError::SymbolNotFound(format!("{target:#x}"))),
        }
    }
}

/// A tiny script engine with the eval/release ABI of the client's engine.
///
/// `"a+b"` over integers evaluates to the sum; anything else echoes back.
/// Results are heap strings counted until released.
pub mod script_engine {
    use std::collections::HashMap;
    use std::ffi::{c_char, CString};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock};

    use core::ffi::c_void;

    static LIVE: AtomicUsize = AtomicUsize::new(0);
    static FIRST_CONTEXT: u8 = 1;
    static SECOND_CONTEXT: u8 = 2;

    fn evaluations() -> &'static Mutex<HashMap<String, usize>> {
        static EVALUATIONS: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
        EVALUATIONS.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub fn context() -> *mut c_void {
        &FIRST_CONTEXT as *const u8 as *mut c_void
    }

    pub fn other_context() -> *mut c_void {
        &SECOND_CONTEXT as *const u8 as *mut c_void
    }

    pub fn live_allocations() -> usize {
        LIVE.load(Ordering::SeqCst)
    }

    /// How many times `source` has been evaluated.
    pub fn evaluated(source: &str) -> usize {
        evaluations().lock().unwrap().get(source).copied().unwrap_or(0)
    }

    fn evaluate(source: &str) -> String {
        if let Some((a, b)) = source.split_once('+') {
            if let (Ok(a), Ok(b)) = (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
                return (a + b).to_string();
            }
        }
        source.to_string()
    }

    /// Heap string the engine hands out; freed by [`fake_release`].
    pub fn alloc_raw(bytes: &[u8]) -> *mut c_char {
        let Ok(s) = CString::new(bytes) else {
            return core::ptr::null_mut();
        };
        LIVE.fetch_add(1, Ordering::SeqCst);
        s.into_raw()
    }

    pub unsafe extern "C" fn fake_eval(_ctx: *mut c_void, source: *const c_char, len: usize) -> *mut c_char {
        if source.is_null() {
            return core::ptr::null_mut();
        }
        let bytes = std::slice::from_raw_parts(source as *const u8, len);
        let source = String::from_utf8_lossy(bytes).into_owned();
        let result = evaluate(&source);
        *evaluations().lock().unwrap().entry(source).or_default() += 1;
        alloc_raw(result.as_bytes())
    }

    pub unsafe extern "C" fn fake_release(result: *mut c_char) {
        if result.is_null() {
            return;
        }
        drop(CString::from_raw(result));
        LIVE.fetch_sub(1, Ordering::SeqCst);
    }

    #[test]
    fn sums_and_echoes() {
        assert_eq!(evaluate("1+1"), "2");
        assert_eq!(evaluate(" 2 + 3 "), "5");
        assert_eq!(evaluate("'hello'"), "'hello'");
        assert_eq!(evaluate("a+1"), "a+1");
    }
}
