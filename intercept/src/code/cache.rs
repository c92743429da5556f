/// Make freshly written instructions visible to instruction fetch.
///
/// AArch64 keeps separate, non-coherent I and D caches, so new code must be
/// cleaned to the point of unification before it is executed.
///
/// # Safety
/// `addr` must point to at least `size` bytes of mapped memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(all(linux_like, any(target_arch = "aarch64", target_arch = "arm")))]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    // x86 keeps its I-cache coherent.
    #[cfg(not(all(linux_like, any(target_arch = "aarch64", target_arch = "arm"))))]
    {
        let _ = (addr, size);
    }
}
