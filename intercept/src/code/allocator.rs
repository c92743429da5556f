use crate::types::HookError;

// Linux 4.17+. Older kernels ignore the flag and treat the address as a hint,
// so the result is always checked against the request.
#[cfg(linux_like)]
const MAP_FIXED_NOREPLACE: libc::c_int = 0x100000;

/// A writable block of memory that will hold trampolines.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self {
            slab_size: super::page_size(),
        }
    }
}

impl CodeAllocator {
    pub fn new(slab_size: usize) -> Self {
        let page = super::page_size();
        Self {
            slab_size: slab_size.max(page).next_multiple_of(page),
        }
    }

    /// Allocate a slab within `max_distance` bytes of `near`.
    ///
    /// Gaps are located from `/proc/self/maps`. Fails with
    /// [`HookError::AllocationFailed`] when nothing in range is free.
    #[cfg(linux_like)]
    pub fn alloc_near(&mut self, near: *const u8, max_distance: usize) -> Result<CodeSlice, HookError> {
        let page = super::page_size();
        let need = self.slab_size;
        let near = near as usize;
        let win_start = near.saturating_sub(max_distance).max(page) & !(page - 1);
        let win_end = near.saturating_add(max_distance) & !(page - 1);

        let mut regions: Vec<(usize, usize)> = crate::module::maps::read_self_maps()
            .map_err(|_| HookError::AllocationFailed)?
            .into_iter()
            .map(|m| (m.start, m.end))
            .collect();
        regions.sort_unstable();

        let mut gaps = Vec::new();
        let mut prev_end = win_start;
        for &(start, end) in &regions {
            if start >= win_end {
                break;
            }
            if start > prev_end {
                gaps.push((prev_end, start));
            }
            prev_end = prev_end.max(end);
        }
        if prev_end < win_end {
            gaps.push((prev_end, win_end));
        }

        for (gap_start, gap_end) in gaps {
            if gap_end - gap_start < need {
                continue;
            }
            let candidate = near.clamp(gap_start, gap_end - need) & !(page - 1);
            if let Some(slice) = unsafe { self.map_at(candidate) } {
                return Ok(slice);
            }
        }
        Err(HookError::AllocationFailed)
    }

    #[cfg(not(linux_like))]
    pub fn alloc_near(&mut self, _near: *const u8, _max_distance: usize) -> Result<CodeSlice, HookError> {
        Err(HookError::Unsupported)
    }

    #[cfg(linux_like)]
    unsafe fn map_at(&self, address: usize) -> Option<CodeSlice> {
        let ptr = libc::mmap(
            address as *mut libc::c_void,
            self.slab_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_FIXED_NOREPLACE,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return None;
        }
        if ptr as usize != address {
            libc::munmap(ptr, self.slab_size);
            return None;
        }
        Some(CodeSlice {
            data: ptr as *mut u8,
            pc: ptr as *const u8,
            size: self.slab_size,
        })
    }

    /// Allocate a slab anywhere in the address space.
    #[cfg(linux_like)]
    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HookError::AllocationFailed);
        }
        Ok(CodeSlice {
            data: ptr as *mut u8,
            pc: ptr as *const u8,
            size: self.slab_size,
        })
    }

    #[cfg(not(linux_like))]
    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        Err(HookError::Unsupported)
    }

    /// Flip a finished slab to RX.
    ///
    /// # Safety
    /// `slice` must come from this allocator and no thread may be writing to it.
    #[cfg(linux_like)]
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<(), HookError> {
        if libc::mprotect(
            slice.data as *mut libc::c_void,
            slice.size,
            libc::PROT_READ | libc::PROT_EXEC,
        ) != 0
        {
            return Err(HookError::ProtectFailed);
        }
        super::cache::invalidate_icache(slice.data, slice.size);
        Ok(())
    }

    #[cfg(not(linux_like))]
    pub unsafe fn make_executable(&self, _slice: &CodeSlice) -> Result<(), HookError> {
        Err(HookError::Unsupported)
    }

    /// Return a slab that never became live.
    ///
    /// # Safety
    /// Nothing may reference code inside `slice`.
    #[cfg(linux_like)]
    pub unsafe fn release(&self, slice: CodeSlice) {
        libc::munmap(slice.data as *mut libc::c_void, slice.size);
    }

    #[cfg(not(linux_like))]
    pub unsafe fn release(&self, _slice: CodeSlice) {}
}
