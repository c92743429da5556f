pub mod allocator;
pub mod cache;
pub mod patcher;

pub use allocator::{CodeAllocator, CodeSlice};
pub use patcher::patch_code;

/// Size of a memory page.
#[inline]
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// Round `[addr, addr + size)` out to page boundaries, returning `(start, len)`.
#[inline]
pub fn page_span(addr: usize, size: usize) -> (usize, usize) {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + size.max(1) + page - 1) & !(page - 1);
    (start, end - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_covers_straddling_range() {
        let page = page_size();
        let (start, len) = page_span(page * 3 - 2, 4);
        assert_eq!(start, page * 2);
        assert_eq!(len, page * 2);
    }

    #[test]
    fn page_span_of_empty_range_is_one_page() {
        let page = page_size();
        assert_eq!(page_span(page * 5, 0), (page * 5, page));
    }
}
