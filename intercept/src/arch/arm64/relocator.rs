use crate::arch::arm64::writer::{Arm64Writer, Reg};
use crate::types::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    Plain,
    B,
    Bl,
    BCond,
    Cbz,
    Tbz,
    Adr,
    Adrp,
    /// PC-relative literal load; the payload is the equivalent `[Xn, #0]` load with Rn/Rt cleared.
    Literal { base_load: u32, gpr: bool },
}

fn classify(insn: u32) -> Form {
    match insn & 0xFC00_0000 {
        0x1400_0000 => return Form::B,
        0x9400_0000 => return Form::Bl,
        _ => {}
    }
    if insn & 0xFF00_0010 == 0x5400_0000 {
        return Form::BCond;
    }
    match insn & 0x7E00_0000 {
        0x3400_0000 => return Form::Cbz,
        0x3600_0000 => return Form::Tbz,
        _ => {}
    }
    match insn & 0x9F00_0000 {
        0x1000_0000 => return Form::Adr,
        0x9000_0000 => return Form::Adrp,
        _ => {}
    }
    match insn & 0xFF00_0000 {
        0x1800_0000 => Form::Literal { base_load: 0xB940_0000, gpr: true },  // ldr wt
        0x5800_0000 => Form::Literal { base_load: 0xF940_0000, gpr: true },  // ldr xt
        0x9800_0000 => Form::Literal { base_load: 0xB980_0000, gpr: true },  // ldrsw xt
        0x1C00_0000 => Form::Literal { base_load: 0xBD40_0000, gpr: false }, // ldr st
        0x5C00_0000 => Form::Literal { base_load: 0xFD40_0000, gpr: false }, // ldr dt
        0x9C00_0000 => Form::Literal { base_load: 0x3DC0_0000, gpr: false }, // ldr qt
        _ => Form::Plain,
    }
}

/// Bytes the relocated form of `form` occupies in the trampoline.
fn emitted_size(form: Form) -> u64 {
    match form {
        Form::Plain => 4,
        Form::B | Form::Adr | Form::Adrp => 16,
        Form::Bl | Form::BCond | Form::Cbz | Form::Tbz | Form::Literal { .. } => 20,
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn offset_at(pc: u64, delta: i64) -> u64 {
    (pc as i64).wrapping_add(delta) as u64
}

/// X16 unless the relocated code mentions it, then X17.
fn pick_scratch(insns: &[u32]) -> Reg {
    let mentions_x16 = insns.iter().any(|&insn| {
        [insn, insn >> 5, insn >> 10, insn >> 16]
            .iter()
            .any(|field| field & 0x1f == 16)
    });
    if mentions_x16 {
        Reg::X17
    } else {
        Reg::X16
    }
}

/// Copies a function prologue into a trampoline, rewriting PC-relative forms.
pub struct Arm64Relocator<'a> {
    input: &'a [u32],
    input_pc: u64,
}

impl<'a> Arm64Relocator<'a> {
    pub fn new(input: &'a [u32], input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    /// Register the relocated code leaves free for long branches.
    pub fn scratch(&self) -> Reg {
        pick_scratch(self.input)
    }

    /// Emit every input instruction into `writer`.
    ///
    /// Branches that land inside the relocated window are redirected to their
    /// copies; everything else keeps its absolute target.
    ///
    /// # Safety
    /// `writer` must have room for 20 bytes per input instruction.
    pub unsafe fn relocate(&self, writer: &mut Arm64Writer) -> Result<(), HookError> {
        let scratch = self.scratch();
        let start = self.input_pc;
        let end = start + self.input.len() as u64 * 4;

        let mut copies = Vec::with_capacity(self.input.len());
        let mut at = writer.pc();
        for &insn in self.input {
            copies.push(at);
            at += emitted_size(classify(insn));
        }
        let retarget = |target: u64| {
            if (start..end).contains(&target) && (target - start) % 4 == 0 {
                copies[((target - start) / 4) as usize]
            } else {
                target
            }
        };

        for (i, &insn) in self.input.iter().enumerate() {
            let pc = start + i as u64 * 4;
            let rt = Reg::from_field(insn);
            match classify(insn) {
                Form::Plain => writer.put_u32_raw(insn),
                Form::B => {
                    let target = offset_at(pc, sign_extend(insn & 0x03FF_FFFF, 26) << 2);
                    writer.put_ldr_br_address(scratch, retarget(target));
                }
                Form::Bl => {
                    let target = offset_at(pc, sign_extend(insn & 0x03FF_FFFF, 26) << 2);
                    writer.put_call_address(scratch, retarget(target));
                }
                Form::BCond => {
                    let target = offset_at(pc, sign_extend((insn >> 5) & 0x7FFFF, 19) << 2);
                    // b.<inverse cond> over the 16-byte absolute branch
                    let cond = (insn & 0xf) ^ 1;
                    writer.put_u32_raw(0x5400_0000 | (5 << 5) | cond);
                    writer.put_ldr_br_address(scratch, retarget(target));
                }
                Form::Cbz => {
                    let target = offset_at(pc, sign_extend((insn >> 5) & 0x7FFFF, 19) << 2);
                    let inverted = (insn ^ (1 << 24)) & !0x00FF_FFE0 | (5 << 5);
                    writer.put_u32_raw(inverted);
                    writer.put_ldr_br_address(scratch, retarget(target));
                }
                Form::Tbz => {
                    let target = offset_at(pc, sign_extend((insn >> 5) & 0x3FFF, 14) << 2);
                    let inverted = (insn ^ (1 << 24)) & !0x0007_FFE0 | (5 << 5);
                    writer.put_u32_raw(inverted);
                    writer.put_ldr_br_address(scratch, retarget(target));
                }
                Form::Adr | Form::Adrp => {
                    let imm = sign_extend((((insn >> 5) & 0x7FFFF) << 2) | ((insn >> 29) & 3), 21);
                    let value = if classify(insn) == Form::Adrp {
                        offset_at(pc & !0xfff, imm << 12)
                    } else {
                        offset_at(pc, imm)
                    };
                    writer.put_ldr_reg_address(rt, value);
                }
                Form::Literal { base_load, gpr } => {
                    let address = offset_at(pc, sign_extend((insn >> 5) & 0x7FFFF, 19) << 2);
                    // Integer loads can use their own destination as the base.
                    let base = if gpr { rt } else { scratch };
                    writer.put_ldr_reg_address(base, address);
                    writer.put_u32_raw(base_load | (base.index() << 5) | rt.index());
                }
            }
        }
        Ok(())
    }
}
