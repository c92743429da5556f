/// AArch64 general purpose registers. Index 31 encodes SP or XZR depending on the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(u8);

impl Reg {
    pub const X0: Reg = Reg(0);
    pub const X1: Reg = Reg(1);
    pub const X16: Reg = Reg(16);
    pub const X17: Reg = Reg(17);
    pub const X29: Reg = Reg(29);
    pub const X30: Reg = Reg(30);
    pub const SP: Reg = Reg(31);

    /// Register from a 5-bit instruction field.
    pub fn from_field(field: u32) -> Reg {
        Reg((field & 0x1f) as u8)
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }
}

#[derive(Debug)]
pub struct Arm64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
}

impl Arm64Writer {
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

    unsafe fn put_raw<const N: usize>(&mut self, bytes: [u8; N]) {
        debug_assert!(self.offset() + N <= self.size, "arm64 writer overflow");
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, N);
        self.code = self.code.add(N);
        self.pc = self.pc.wrapping_add(N as u64);
    }

    pub unsafe fn put_u32_raw(&mut self, insn: u32) {
        self.put_raw(insn.to_le_bytes());
    }

    unsafe fn put_u64_literal(&mut self, value: u64) {
        self.put_raw(value.to_le_bytes());
    }

    pub unsafe fn put_ret(&mut self) {
        self.put_u32_raw(0xD65F03C0);
    }

    pub unsafe fn put_br_reg(&mut self, reg: Reg) {
        self.put_u32_raw(0xD61F0000 | (reg.index() << 5));
    }

    pub unsafe fn put_blr_reg(&mut self, reg: Reg) {
        self.put_u32_raw(0xD63F0000 | (reg.index() << 5));
    }

    /// ADD Xd, Xn, #imm12
    pub unsafe fn put_add_reg_reg_imm(&mut self, d: Reg, n: Reg, imm: u32) {
        self.put_u32_raw(0x9100_0000 | ((imm & 0xfff) << 10) | (n.index() << 5) | d.index());
    }

    /// B to `target`. Only valid within +-128 MiB.
    pub unsafe fn put_b_imm(&mut self, target: u64) {
        let imm = (target.wrapping_sub(self.pc) as i64) >> 2;
        self.put_u32_raw(0x1400_0000 | ((imm as u32) & 0x03FF_FFFF));
    }

    /// `LDR Xt, #8; BR Xt; .quad addr` (16 bytes, any distance).
    pub unsafe fn put_ldr_br_address(&mut self, reg: Reg, addr: u64) {
        self.put_u32_raw(0x5800_0000 | (2 << 5) | reg.index());
        self.put_br_reg(reg);
        self.put_u64_literal(addr);
    }

    /// `LDR Xt, #8; B #12; .quad value` (16 bytes). Leaves `value` in `reg`.
    pub unsafe fn put_ldr_reg_address(&mut self, reg: Reg, value: u64) {
        self.put_u32_raw(0x5800_0000 | (2 << 5) | reg.index());
        self.put_b_imm(self.pc + 12);
        self.put_u64_literal(value);
    }

    /// Call `addr` through `scratch` (20 bytes). LR points just past the BLR.
    pub unsafe fn put_call_address(&mut self, scratch: Reg, addr: u64) {
        self.put_ldr_reg_address(scratch, addr);
        self.put_blr_reg(scratch);
    }
}
