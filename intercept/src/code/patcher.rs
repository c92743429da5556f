use crate::code::cache::invalidate_icache;
use crate::types::HookError;

/// Overwrite `size` bytes of live code at `addr`.
///
/// The covering pages are made RWX while `apply` runs so other code on the
/// same page keeps executing, then dropped back to RX. The whole span is
/// flushed afterwards because neighbouring functions may have been patched
/// independently.
///
/// # Safety
/// `addr` must point to `size` bytes of executable memory and `apply` must
/// only write inside that range.
#[cfg(linux_like)]
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }

    let (page_start, map_size) = super::page_span(addr as usize, size);

    if libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) != 0
    {
        return Err(HookError::ProtectFailed);
    }

    apply(addr);

    if libc::mprotect(page_start as *mut libc::c_void, map_size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
        log::warn!("patched page {page_start:#x} left writable");
    }

    invalidate_icache(page_start as *mut u8, map_size);
    Ok(())
}

#[cfg(not(linux_like))]
pub unsafe fn patch_code(_addr: *mut u8, _size: usize, _apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
    Err(HookError::Unsupported)
}
