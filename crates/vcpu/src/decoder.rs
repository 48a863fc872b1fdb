//! Scoped x86 instruction decoder (spec.md §4.6 "Instruction cache and
//! decoder").
//!
//! Fetches from a 15-byte window and decodes via a handcrafted match over
//! opcode, prefix, and ModRM byte, exactly the way spec.md describes. This
//! is deliberately not a full ISA: only the subset the BIOS trampoline and
//! PIO/MMIO device paths in this repo actually exercise is modelled
//! (arithmetic, the mov family, in/out, int/iret, jcc, stack ops).
//! Anything else decodes to [`DecodeError::Unsupported`], which the VCPU
//! core turns into a guest `#UD` rather than a host panic.

pub const FETCH_WINDOW: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl ArithOp {
    fn from_group(group: u8) -> ArithOp {
        match group & 0x7 {
            0 => ArithOp::Add,
            1 => ArithOp::Or,
            2 => ArithOp::Adc,
            3 => ArithOp::Sbb,
            4 => ArithOp::And,
            5 => ArithOp::Sub,
            6 => ArithOp::Xor,
            _ => ArithOp::Cmp,
        }
    }
}

/// The 16-bit info word a ModRM byte decodes to (spec.md §4.6): which
/// general registers feed the effective address, whether a SIB byte
/// follows, the displacement width, and whether the default segment is SS
/// (base-pointer-relative addressing) rather than DS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRmInfo {
    pub reg: u8,
    pub rm: u8,
    pub mod_bits: u8,
    pub is_reg_form: bool,
    pub sib_follows: bool,
    pub disp_bytes: u8,
    pub use_ss_default: bool,
}

/// Decode a raw ModRM byte, 32-bit addressing forms (the only ones this
/// scoped decoder needs).
pub fn decode_modrm(byte: u8) -> ModRmInfo {
    let mod_bits = byte >> 6;
    let reg = (byte >> 3) & 0x7;
    let rm = byte & 0x7;

    let is_reg_form = mod_bits == 0b11;
    let sib_follows = !is_reg_form && rm == 0b100;
    let use_ss_default = !is_reg_form && !sib_follows && rm == 0b101 && mod_bits != 0b00;

    let disp_bytes = if is_reg_form {
        0
    } else {
        match mod_bits {
            0b00 => {
                if rm == 0b101 {
                    4 // disp32, no base (RIP/absolute-relative form)
                } else {
                    0
                }
            }
            0b01 => 1,
            0b10 => 4,
            _ => 0,
        }
    };

    ModRmInfo { reg, rm, mod_bits, is_reg_form, sib_follows, disp_bytes, use_ss_default }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOperand {
    Immediate(u8),
    Dx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Arith { op: ArithOp, modrm: ModRmInfo, width: Width, reg_is_dest: bool },
    MovRegMem { modrm: ModRmInfo, width: Width, reg_is_dest: bool },
    MovImmToAl { imm: u8 },
    In { port: PortOperand, width: Width },
    Out { port: PortOperand, width: Width },
    IntN { vector: u8 },
    Iret,
    Jcc { condition: u8, rel: i32 },
    PushReg { reg: u8 },
    PopReg { reg: u8 },
    Hlt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("opcode {0:#x} is outside the modelled instruction subset")]
    Unsupported(u8),
    #[error("fetch window exhausted before the instruction finished decoding")]
    Truncated,
}

/// Decode one instruction starting at `bytes[0]`. Returns the decoded
/// instruction and its total length in bytes (for IP advancement and for
/// the instruction cache's fingerprint comparison).
pub fn decode(bytes: &[u8]) -> Result<(Instruction, usize), DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let op = bytes[0];

    // Arithmetic group: op*8 + {0..3} covers r/m8,r8 / r/m32,r32 /
    // r8,r/m8 / r32,r/m32 forms for each of the eight ALU operations.
    if op < 0x40 && (op & 0x7) < 0x4 {
        let group = op >> 3;
        let form = op & 0x7;
        let width = if form & 1 == 0 { Width::Byte } else { Width::Dword };
        let reg_is_dest = form & 2 != 0;
        let modrm_byte = *bytes.get(1).ok_or(DecodeError::Truncated)?;
        let modrm = decode_modrm(modrm_byte);
        let len = 2 + modrm.disp_bytes as usize + if modrm.sib_follows { 1 } else { 0 };
        return Ok((Instruction::Arith { op: ArithOp::from_group(group), modrm, width, reg_is_dest }, len));
    }

    match op {
        0x88 | 0x89 | 0x8a | 0x8b => {
            let width = if op & 1 == 0 { Width::Byte } else { Width::Dword };
            let reg_is_dest = op & 2 != 0;
            let modrm_byte = *bytes.get(1).ok_or(DecodeError::Truncated)?;
            let modrm = decode_modrm(modrm_byte);
            let len = 2 + modrm.disp_bytes as usize + if modrm.sib_follows { 1 } else { 0 };
            Ok((Instruction::MovRegMem { modrm, width, reg_is_dest }, len))
        }
        0xb0 => {
            let imm = *bytes.get(1).ok_or(DecodeError::Truncated)?;
            Ok((Instruction::MovImmToAl { imm }, 2))
        }
        0xe4 => Ok((Instruction::In { port: PortOperand::Immediate(*bytes.get(1).ok_or(DecodeError::Truncated)?), width: Width::Byte }, 2)),
        0xe5 => Ok((Instruction::In { port: PortOperand::Immediate(*bytes.get(1).ok_or(DecodeError::Truncated)?), width: Width::Dword }, 2)),
        0xe6 => Ok((Instruction::Out { port: PortOperand::Immediate(*bytes.get(1).ok_or(DecodeError::Truncated)?), width: Width::Byte }, 2)),
        0xe7 => Ok((Instruction::Out { port: PortOperand::Immediate(*bytes.get(1).ok_or(DecodeError::Truncated)?), width: Width::Dword }, 2)),
        0xec => Ok((Instruction::In { port: PortOperand::Dx, width: Width::Byte }, 1)),
        0xed => Ok((Instruction::In { port: PortOperand::Dx, width: Width::Dword }, 1)),
        0xee => Ok((Instruction::Out { port: PortOperand::Dx, width: Width::Byte }, 1)),
        0xef => Ok((Instruction::Out { port: PortOperand::Dx, width: Width::Dword }, 1)),
        0xcd => Ok((Instruction::IntN { vector: *bytes.get(1).ok_or(DecodeError::Truncated)? }, 2)),
        0xcf => Ok((Instruction::Iret, 1)),
        0xf4 => Ok((Instruction::Hlt, 1)),
        0x50..=0x57 => Ok((Instruction::PushReg { reg: op - 0x50 }, 1)),
        0x58..=0x5f => Ok((Instruction::PopReg { reg: op - 0x58 }, 1)),
        0x70..=0x7f => {
            let rel8 = *bytes.get(1).ok_or(DecodeError::Truncated)? as i8;
            Ok((Instruction::Jcc { condition: op - 0x70, rel: rel8 as i32 }, 2))
        }
        0x0f => {
            let op2 = *bytes.get(1).ok_or(DecodeError::Truncated)?;
            match op2 {
                0x80..=0x8f => {
                    let b = bytes.get(2..6).ok_or(DecodeError::Truncated)?;
                    let rel32 = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    Ok((Instruction::Jcc { condition: op2 - 0x80, rel: rel32 }, 6))
                }
                other => Err(DecodeError::Unsupported(other)),
            }
        }
        other => Err(DecodeError::Unsupported(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_int_13h() {
        let (instr, len) = decode(&[0xcd, 0x13]).unwrap();
        assert_eq!(instr, Instruction::IntN { vector: 0x13 });
        assert_eq!(len, 2);
    }

    #[test]
    fn decodes_iret_and_hlt_as_single_byte() {
        assert_eq!(decode(&[0xcf]).unwrap(), (Instruction::Iret, 1));
        assert_eq!(decode(&[0xf4]).unwrap(), (Instruction::Hlt, 1));
    }

    #[test]
    fn decodes_in_al_dx_and_out_dx_al() {
        assert_eq!(decode(&[0xec]).unwrap().0, Instruction::In { port: PortOperand::Dx, width: Width::Byte });
        assert_eq!(decode(&[0xee]).unwrap().0, Instruction::Out { port: PortOperand::Dx, width: Width::Byte });
    }

    #[test]
    fn decodes_short_jcc_with_signed_displacement() {
        let (instr, len) = decode(&[0x74, 0xfe]).unwrap(); // JZ -2
        assert_eq!(instr, Instruction::Jcc { condition: 4, rel: -2 });
        assert_eq!(len, 2);
    }

    #[test]
    fn decodes_near_jcc_with_32_bit_displacement() {
        let bytes = [0x0f, 0x84, 0x10, 0x00, 0x00, 0x00];
        let (instr, len) = decode(&bytes).unwrap();
        assert_eq!(instr, Instruction::Jcc { condition: 4, rel: 0x10 });
        assert_eq!(len, 6);
    }

    #[test]
    fn decodes_add_rm32_r32_with_modrm() {
        // ADD [EAX+0x10], ECX — opcode 0x01, modrm 0x48 (mod=01 reg=001 rm=000)
        let (instr, len) = decode(&[0x01, 0x48, 0x10]).unwrap();
        match instr {
            Instruction::Arith { op: ArithOp::Add, width: Width::Dword, reg_is_dest: false, modrm } => {
                assert_eq!(modrm.reg, 1);
                assert_eq!(modrm.rm, 0);
                assert_eq!(modrm.disp_bytes, 1);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
        assert_eq!(len, 3);
    }

    #[test]
    fn unsupported_opcode_is_reported_not_panicked() {
        assert_eq!(decode(&[0x0f, 0x05]).unwrap_err(), DecodeError::Unsupported(0x05));
    }

    #[test]
    fn modrm_reg_form_has_no_displacement_or_sib() {
        let info = decode_modrm(0xc1); // mod=11 reg=000 rm=001
        assert!(info.is_reg_form);
        assert_eq!(info.disp_bytes, 0);
        assert!(!info.sib_follows);
    }

    #[test]
    fn modrm_disp32_no_base_form_reads_four_byte_displacement() {
        let info = decode_modrm(0x05); // mod=00 rm=101
        assert_eq!(info.disp_bytes, 4);
        assert!(!info.is_reg_form);
    }

    #[test]
    fn modrm_ebp_relative_defaults_to_ss_segment() {
        let info = decode_modrm(0x45); // mod=01 rm=101 (EBP+disp8)
        assert!(info.use_ss_default);
        assert_eq!(info.disp_bytes, 1);
    }
}
