use crate::arch::x86_64::writer::X86_64Writer;
use crate::types::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    Plain,
    /// ModRM addresses `[rip + disp32]`; `disp_at` is the displacement's offset.
    RipRelative { disp_at: usize },
    Jmp { rel: i64 },
    Jcc { cc: u8, rel: i64 },
    Call { rel: i64 },
    /// ret, int3, hlt, ud2: nothing after these belongs to the function body.
    Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Insn {
    len: usize,
    form: Form,
}

fn has_modrm(opcode: u8) -> bool {
    matches!(
        opcode,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x63
            | 0x69
            | 0x6B
            | 0x80..=0x8F
            | 0xC0..=0xC1
            | 0xC6..=0xC7
            | 0xD0..=0xD3
            | 0xD8..=0xDF
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

fn immediate_len(opcode: u8, modrm: Option<u8>, opsize16: bool, rex_w: bool) -> usize {
    let imm_z = if opsize16 { 2 } else { 4 };
    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => imm_z,
        0x68 | 0x69 | 0x81 | 0xA9 | 0xC7 => imm_z,
        0x6A | 0x6B | 0x80 | 0x82 | 0x83 | 0xA8 | 0xC0 | 0xC1 | 0xC6 => 1,
        0xB0..=0xB7 => 1,
        0xB8..=0xBF if rex_w => 8,
        0xB8..=0xBF => imm_z,
        // moffs is a full 64-bit address in long mode
        0xA0..=0xA3 => 8,
        0xC8 => 3,
        0xCD => 1,
        // test r/m, imm lives in group 3 /0 and /1
        0xF6 if modrm.is_some_and(|m| (m >> 3) & 7 <= 1) => 1,
        0xF7 if modrm.is_some_and(|m| (m >> 3) & 7 <= 1) => imm_z,
        _ => 0,
    }
}

/// Length of a ModRM operand (ModRM + SIB + displacement) starting at `code[0]`.
fn modrm_len(code: &[u8]) -> Option<(usize, bool)> {
    let modrm = *code.first()?;
    let (mode, rm) = (modrm >> 6, modrm & 7);
    if mode == 3 {
        return Some((1, false));
    }
    if mode == 0 && rm == 5 {
        return Some((5, true));
    }
    let mut len = 1;
    if rm == 4 {
        let sib = *code.get(1)?;
        len += 1;
        if mode == 0 && sib & 7 == 5 {
            len += 4;
        }
    }
    len += match mode {
        1 => 1,
        2 => 4,
        _ => 0,
    };
    Some((len, false))
}

fn read_i32(code: &[u8], at: usize) -> Option<i64> {
    let bytes: [u8; 4] = code.get(at..at + 4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes) as i64)
}

/// Decode one instruction of the kinds found in compiled prologues.
fn decode(code: &[u8]) -> Option<Insn> {
    let mut pos = 0;
    let mut opsize16 = false;
    while let Some(&b) = code.get(pos) {
        match b {
            0x66 => opsize16 = true,
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 | 0xF2 | 0xF3 => {}
            _ => break,
        }
        pos += 1;
    }
    let mut rex_w = false;
    if let Some(&rex) = code.get(pos).filter(|&&b| b & 0xF0 == 0x40) {
        rex_w = rex & 0x08 != 0;
        pos += 1;
    }

    let opcode = *code.get(pos)?;
    pos += 1;
    let done = |len: usize, form: Form| (len <= code.len()).then_some(Insn { len, form });

    match opcode {
        0xC3 | 0xCC | 0xF4 => return done(pos, Form::Terminator),
        0xC2 => return done(pos + 2, Form::Terminator),
        0xEB => {
            let rel = *code.get(pos)? as i8 as i64;
            return done(pos + 1, Form::Jmp { rel });
        }
        0xE9 => return done(pos + 4, Form::Jmp { rel: read_i32(code, pos)? }),
        0xE8 => return done(pos + 4, Form::Call { rel: read_i32(code, pos)? }),
        0x70..=0x7F => {
            let rel = *code.get(pos)? as i8 as i64;
            return done(pos + 1, Form::Jcc { cc: opcode & 0xf, rel });
        }
        // loop/jrcxz cannot be widened
        0xE0..=0xE3 => return None,
        0x0F => return decode_two_byte(code, pos),
        _ => {}
    }

    let mut form = Form::Plain;
    let mut modrm = None;
    if has_modrm(opcode) {
        let (len, rip) = modrm_len(&code[pos..])?;
        if rip {
            form = Form::RipRelative { disp_at: pos + 1 };
        }
        modrm = Some(code[pos]);
        pos += len;
    }
    pos += immediate_len(opcode, modrm, opsize16, rex_w);
    done(pos, form)
}

fn decode_two_byte(code: &[u8], mut pos: usize) -> Option<Insn> {
    let op2 = *code.get(pos)?;
    pos += 1;
    let done = |len: usize, form: Form| (len <= code.len()).then_some(Insn { len, form });
    match op2 {
        0x0B => return done(pos, Form::Terminator),
        0x80..=0x8F => {
            let rel = read_i32(code, pos)?;
            return done(pos + 4, Form::Jcc { cc: op2 & 0xf, rel });
        }
        // syscall, cpuid, rdtsc and friends
        0x05 | 0x31 | 0xA2 | 0x77 => return done(pos, Form::Plain),
        _ => {}
    }

    let (op3_imm, skip) = match op2 {
        0x38 => (0, 1),
        0x3A => (1, 1),
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => (1, 0),
        _ => (0, 0),
    };
    pos += skip;
    let (len, rip) = modrm_len(code.get(pos..)?)?;
    let form = if rip {
        Form::RipRelative { disp_at: pos + 1 }
    } else {
        Form::Plain
    };
    done(pos + len + op3_imm, form)
}

/// Returns true if `code` starts with ENDBR64 (F3 0F 1E FA).
pub fn is_endbr64(code: &[u8]) -> bool {
    code.starts_with(&[0xF3, 0x0F, 0x1E, 0xFA])
}

/// Copies whole instructions from a function prologue into a trampoline.
pub struct X86_64Relocator<'a> {
    input: &'a [u8],
    input_pc: u64,
}

impl<'a> X86_64Relocator<'a> {
    /// `input` is a window of readable bytes starting at the function entry.
    pub fn new(input: &'a [u8], input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    /// Number of bytes occupied by whole instructions covering at least `min_bytes`.
    pub fn measure(&self, min_bytes: usize) -> Result<usize, HookError> {
        let mut offset = 0;
        while offset < min_bytes {
            let insn = decode(&self.input[offset..]).ok_or(HookError::RelocationFailed)?;
            offset += insn.len;
            if insn.form == Form::Terminator && offset < min_bytes {
                return Err(HookError::RelocationFailed);
            }
        }
        Ok(offset)
    }

    /// Relocate whole instructions covering at least `min_bytes` and return
    /// the number of source bytes consumed.
    ///
    /// # Safety
    /// `writer` must have room for 16 bytes per source byte consumed.
    pub unsafe fn relocate_bytes(&self, writer: &mut X86_64Writer, min_bytes: usize) -> Result<usize, HookError> {
        let mut offset = 0;
        while offset < min_bytes {
            let bytes = &self.input[offset..];
            let insn = decode(bytes).ok_or(HookError::RelocationFailed)?;
            let src_pc = self.input_pc + offset as u64;
            let next_pc = src_pc + insn.len as u64;
            let target = |rel: i64| (next_pc as i64).wrapping_add(rel) as u64;

            match insn.form {
                Form::Terminator => {
                    if offset + insn.len < min_bytes {
                        return Err(HookError::RelocationFailed);
                    }
                    writer.put_bytes(&bytes[..insn.len]);
                }
                Form::Plain => writer.put_bytes(&bytes[..insn.len]),
                Form::RipRelative { disp_at } => {
                    let disp = read_i32(bytes, disp_at).ok_or(HookError::RelocationFailed)?;
                    let absolute = target(disp);
                    let new_disp = absolute.wrapping_sub(writer.pc() + insn.len as u64) as i64;
                    let new_disp = i32::try_from(new_disp).map_err(|_| HookError::RelocationFailed)?;
                    let mut copy = bytes[..insn.len].to_vec();
                    copy[disp_at..disp_at + 4].copy_from_slice(&new_disp.to_le_bytes());
                    writer.put_bytes(&copy);
                }
                Form::Jmp { rel } => writer.put_jmp_address(target(rel)),
                Form::Jcc { cc, rel } => writer.put_jcc_address(cc, target(rel)),
                // call $+0 is the get-pc idiom: only the pushed return address matters
                Form::Call { rel: 0 } => writer.put_push_u64(next_pc),
                Form::Call { rel } => writer.put_call_address(target(rel)),
            }
            offset += insn.len;
        }
        Ok(offset)
    }
}
