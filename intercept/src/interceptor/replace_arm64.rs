use super::ReplacementEntry;
use crate::arch::arm64::{Arm64Relocator, Arm64Writer};
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::patch_code;
use crate::types::HookError;
use core::ffi::c_void;

/// `LDR X16, #8; BR X16; .quad replacement`
const REDIRECT_INSNS: usize = 4;
const REDIRECT_SIZE: usize = REDIRECT_INSNS * 4;

pub(super) unsafe fn replace(
    function_address: *mut c_void,
    replacement: *const c_void,
) -> Result<ReplacementEntry, HookError> {
    let entry = function_address as *mut u8;
    let prologue: [u32; REDIRECT_INSNS] = core::ptr::read_unaligned(entry as *const _);

    // Trampoline: relocated prologue, then jump back past the redirect.
    let mut alloc = CodeAllocator::default();
    let slice = alloc.alloc_any()?;
    let relocator = Arm64Relocator::new(&prologue, entry as u64);
    let built = (|| {
        let mut w = Arm64Writer::new(slice.data, slice.size, slice.pc as u64);
        relocator.relocate(&mut w)?;
        w.put_ldr_br_address(relocator.scratch(), entry as u64 + REDIRECT_SIZE as u64);
        alloc.make_executable(&slice)
    })();
    if let Err(e) = built {
        alloc.release(slice);
        return Err(e);
    }

    let mut stub = [0u8; REDIRECT_SIZE];
    let mut w = Arm64Writer::new(stub.as_mut_ptr(), stub.len(), entry as u64);
    w.put_ldr_br_address(relocator.scratch(), replacement as u64);

    let original_bytes = core::slice::from_raw_parts(entry, REDIRECT_SIZE).to_vec();
    patch_code(entry, REDIRECT_SIZE, |p| {
        core::ptr::copy_nonoverlapping(stub.as_ptr(), p, REDIRECT_SIZE);
    })?;

    Ok(ReplacementEntry {
        patch_at: entry as usize,
        original_bytes,
        trampoline: slice,
    })
}
