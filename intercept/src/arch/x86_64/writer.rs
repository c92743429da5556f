/// `jmp rel32`
pub const NEAR_JMP_SIZE: usize = 5;
/// `jmp [rip+0]; .quad target`
pub const FAR_JMP_SIZE: usize = 14;

pub fn in_rel32_range(from_next_pc: u64, target: u64) -> bool {
    let delta = target.wrapping_sub(from_next_pc) as i64;
    i32::try_from(delta).is_ok()
}

#[derive(Debug)]
pub struct X86_64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
}

impl X86_64Writer {
    /// # Safety
    /// `buffer` must be valid for writes of `size` bytes while the writer is used.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer,
            code: buffer,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        self.code as usize - self.base as usize
    }

    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.offset() + bytes.len() <= self.size, "x86_64 writer overflow");
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
        self.code = self.code.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    fn rel32(&self, insn_len: u64, target: u64) -> [u8; 4] {
        (target.wrapping_sub(self.pc + insn_len) as i32).to_le_bytes()
    }

    pub unsafe fn put_jmp_near(&mut self, target: u64) {
        let rel = self.rel32(NEAR_JMP_SIZE as u64, target);
        self.put_bytes(&[0xE9, rel[0], rel[1], rel[2], rel[3]]);
    }

    pub unsafe fn put_jmp_far(&mut self, target: u64) {
        self.put_bytes(&[0xFF, 0x25, 0, 0, 0, 0]);
        self.put_bytes(&target.to_le_bytes());
    }

    /// Near jump when reachable, otherwise the 14-byte absolute form.
    pub unsafe fn put_jmp_address(&mut self, target: u64) {
        if in_rel32_range(self.pc + NEAR_JMP_SIZE as u64, target) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// `call [rip+2]; jmp +8; .quad target` (16 bytes, clobbers nothing).
    pub unsafe fn put_call_address(&mut self, target: u64) {
        self.put_bytes(&[0xFF, 0x15, 0x02, 0, 0, 0, 0xEB, 0x08]);
        self.put_bytes(&target.to_le_bytes());
    }

    /// `j<!cc> +14; jmp [rip+0]; .quad target`
    pub unsafe fn put_jcc_address(&mut self, cc: u8, target: u64) {
        self.put_bytes(&[0x70 | ((cc & 0xf) ^ 1), FAR_JMP_SIZE as u8]);
        self.put_jmp_far(target);
    }

    /// Push a 64-bit constant without disturbing any register (15 bytes).
    pub unsafe fn put_push_u64(&mut self, value: u64) {
        self.put_bytes(&[0x50, 0x48, 0xB8]); // push rax; mov rax, imm64
        self.put_bytes(&value.to_le_bytes());
        self.put_bytes(&[0x48, 0x87, 0x04, 0x24]); // xchg [rsp], rax
    }

    pub unsafe fn put_ret(&mut self) {
        self.put_bytes(&[0xC3]);
    }

    pub unsafe fn put_nop_n(&mut self, n: usize) {
        for _ in 0..n {
            self.put_bytes(&[0x90]);
        }
    }
}
