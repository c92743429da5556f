//! veil-intercept: inline function interception for the veil agent.
//!
//! Provides module discovery (`dl_iterate_phdr`, `/proc/self/maps`, dynamic
//! symbol tables, byte signatures), executable page allocation, code
//! patching and prologue relocation for AArch64 and x86-64.

pub mod arch;
pub mod code;
pub mod interceptor;
pub mod module;
pub mod types;

pub use interceptor::Interceptor;
pub use module::scan::Signature;
pub use types::{HookError, MemoryMapping, ModuleInfo, Protection};

/// Process-global lock for tests that modify executable code (interceptor + patcher).
///
/// Tests that patch pages shared with other tests must hold this lock so two
/// threads never flip protections on the same page concurrently.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
