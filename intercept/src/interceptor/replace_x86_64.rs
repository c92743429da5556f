use super::ReplacementEntry;
use crate::arch::x86_64::writer::{in_rel32_range, FAR_JMP_SIZE, NEAR_JMP_SIZE};
use crate::arch::x86_64::{is_endbr64, X86_64Relocator, X86_64Writer};
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::patch_code;
use crate::types::HookError;
use core::ffi::c_void;

/// Bytes decoded from the entry: the longest redirect plus one maximal instruction.
const DECODE_WINDOW: usize = FAR_JMP_SIZE + 15;

/// Trampoline slabs are placed within this distance so a 5-byte jump reaches them.
const NEAR_RANGE: usize = 0x7FFF_0000;

pub(super) unsafe fn replace(
    function_address: *mut c_void,
    replacement: *const c_void,
) -> Result<ReplacementEntry, HookError> {
    let mut patch_at = function_address as *mut u8;
    if is_endbr64(core::slice::from_raw_parts(patch_at, 4)) {
        patch_at = patch_at.add(4);
    }
    let patch_pc = patch_at as u64;
    let window = core::slice::from_raw_parts(patch_at as *const u8, DECODE_WINDOW);
    let relocator = X86_64Relocator::new(window, patch_pc);

    let mut alloc = CodeAllocator::default();
    let slice = alloc
        .alloc_near(patch_at, NEAR_RANGE)
        .or_else(|_| alloc.alloc_any())?;

    let after_jmp = patch_pc + NEAR_JMP_SIZE as u64;
    let replacement_near = in_rel32_range(after_jmp, replacement as u64);
    let slab_near = in_rel32_range(after_jmp, slice.pc as u64)
        && in_rel32_range(after_jmp, slice.pc as u64 + slice.size as u64);

    // A far replacement is reached through a relay on a near slab; with
    // neither in range the entry takes the 14-byte absolute jump.
    let redirect_size = if replacement_near || slab_near {
        NEAR_JMP_SIZE
    } else {
        FAR_JMP_SIZE
    };

    let built = (|| {
        let consumed = relocator.measure(redirect_size)?;
        let mut w = X86_64Writer::new(slice.data, slice.size, slice.pc as u64);
        relocator.relocate_bytes(&mut w, redirect_size)?;
        w.put_jmp_address(patch_pc + consumed as u64);

        let target = if replacement_near || !slab_near {
            replacement as u64
        } else {
            let relay = w.pc();
            w.put_jmp_far(replacement as u64);
            relay
        };
        alloc.make_executable(&slice)?;
        Ok((consumed, target))
    })();
    let (consumed, target) = match built {
        Ok(done) => done,
        Err(e) => {
            alloc.release(slice);
            return Err(e);
        }
    };

    let mut stub = [0x90u8; DECODE_WINDOW];
    let mut w = X86_64Writer::new(stub.as_mut_ptr(), stub.len(), patch_pc);
    if redirect_size == NEAR_JMP_SIZE {
        w.put_jmp_near(target);
    } else {
        w.put_jmp_far(target);
    }

    let original_bytes = window[..consumed].to_vec();
    patch_code(patch_at, consumed, |p| {
        core::ptr::copy_nonoverlapping(stub.as_ptr(), p, consumed);
    })?;

    Ok(ReplacementEntry {
        patch_at: patch_at as usize,
        original_bytes,
        trampoline: slice,
    })
}
