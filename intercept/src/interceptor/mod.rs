use crate::code::allocator::CodeSlice;
use crate::types::HookError;
use core::ffi::c_void;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

#[cfg(all(target_arch = "aarch64", linux_like))]
mod replace_arm64;

#[cfg(all(target_arch = "x86_64", linux_like))]
mod replace_x86_64;

/// Bookkeeping for one patched function.
struct ReplacementEntry {
    /// First byte that was overwritten (after ENDBR64 on x86-64).
    patch_at: usize,
    original_bytes: Vec<u8>,
    /// Never unmapped: a thread may still be running the original through it.
    trampoline: CodeSlice,
}

/// Inline function replacement.
///
/// `replace` overwrites the entry of a function with a jump to the
/// replacement and hands back a trampoline that runs the original. One
/// replacement per address; `revert` restores the saved bytes.
pub struct Interceptor {
    replacements: Mutex<HashMap<usize, ReplacementEntry>>,
}

impl Interceptor {
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: OnceLock<Interceptor> = OnceLock::new();
        INSTANCE.get_or_init(|| Interceptor {
            replacements: Mutex::new(HashMap::new()),
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<usize, ReplacementEntry>> {
        self.replacements.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Redirect `function_address` to `replacement`; returns the trampoline.
    ///
    /// # Safety
    /// `function_address` must be the entry of a function with at least 16
    /// bytes of code, and `replacement` must have the same ABI.
    pub unsafe fn replace(
        &self,
        function_address: *mut c_void,
        replacement: *const c_void,
    ) -> Result<*const c_void, HookError> {
        let mut table = self.table();
        if table.contains_key(&(function_address as usize)) {
            return Err(HookError::AlreadyAttached);
        }

        let entry = install(function_address, replacement)?;
        let trampoline = entry.trampoline.pc as *const c_void;
        log::debug!(
            "replaced {:p} -> {:p} (trampoline {:p})",
            function_address,
            replacement,
            trampoline
        );
        table.insert(function_address as usize, entry);
        Ok(trampoline)
    }

    /// Restore the original bytes. Reverting an address that was never replaced is a no-op.
    pub fn revert(&self, function_address: *mut c_void) -> Result<(), HookError> {
        let mut table = self.table();
        let Some(entry) = table.get(&(function_address as usize)) else {
            return Ok(());
        };
        let original = &entry.original_bytes;
        unsafe {
            crate::code::patcher::patch_code(entry.patch_at as *mut u8, original.len(), |p| {
                core::ptr::copy_nonoverlapping(original.as_ptr(), p, original.len());
            })?;
        }
        table.remove(&(function_address as usize));
        Ok(())
    }

    pub fn is_replaced(&self, function_address: *const c_void) -> bool {
        self.table().contains_key(&(function_address as usize))
    }
}

#[cfg(all(target_arch = "aarch64", linux_like))]
unsafe fn install(function_address: *mut c_void, replacement: *const c_void) -> Result<ReplacementEntry, HookError> {
    replace_arm64::replace(function_address, replacement)
}

#[cfg(all(target_arch = "x86_64", linux_like))]
unsafe fn install(function_address: *mut c_void, replacement: *const c_void) -> Result<ReplacementEntry, HookError> {
    replace_x86_64::replace(function_address, replacement)
}

#[cfg(not(all(any(target_arch = "aarch64", target_arch = "x86_64"), linux_like)))]
unsafe fn install(_function_address: *mut c_void, _replacement: *const c_void) -> Result<ReplacementEntry, HookError> {
    Err(HookError::Unsupported)
}
