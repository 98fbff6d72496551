//! Opcode classification and the top-level `decode` entry point.

use crate::modrm::{parse_modrm, ModRm};
use crate::prefix::{consume_prefixes, FatalPrefix, Prefixes};

/// The instruction category the translator dispatches on, one variant
/// per per-category rewriter; `Unknown`/`Invalid`/`Privileged`/
/// `Unsupported` are lumped together at the call site (all are
/// translator-fatal) but kept distinct here for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    Normal,
    CallDirect,
    CallIndirect,
    Ret,
    RetnImm16,
    JmpDirect,
    JmpIndirect,
    Jcc { cc: u8 },
    JccRel8,
    Int,
    MovFromSeg,
    MovToSeg,
    Unknown,
    Invalid,
    Privileged,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmSize {
    None,
    Imm8,
    Imm16,
    Imm32,
    /// Resolves to 2 with the operand-size prefix, else 4.
    OperandSize,
}

impl ImmSize {
    pub fn resolve(self, opsize_prefix: bool) -> usize {
        match self {
            ImmSize::None => 0,
            ImmSize::Imm8 => 1,
            ImmSize::Imm16 => 2,
            ImmSize::Imm32 => 4,
            ImmSize::OperandSize => {
                if opsize_prefix {
                    2
                } else {
                    4
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decoded<'a> {
    pub prefixes: Prefixes,
    pub escape_0x0f: bool,
    pub opcode: u8,
    pub has_modrm: bool,
    pub modrm: Option<ModRm>,
    pub imm: &'a [u8],
    pub kind: InsnKind,
    /// Total length of the instruction in bytes, from the first prefix
    /// byte through the last immediate byte.
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    FatalPrefix(u8),
}

/// Decode one instruction starting at `code[0]`.
pub fn decode(code: &[u8]) -> Result<Decoded<'_>, DecodeError> {
    let mut pos = 0;
    let prefixes = consume_prefixes(code, &mut pos).map_err(|FatalPrefix(b)| DecodeError::FatalPrefix(b))?;

    let mut escape_0x0f = false;
    let mut opcode = code[pos];
    pos += 1;
    if opcode == 0x0F {
        escape_0x0f = true;
        opcode = code[pos];
        pos += 1;
    }

    let has_modrm = has_modrm_for(opcode, escape_0x0f);
    let modrm = if has_modrm {
        let m = parse_modrm(code, pos);
        pos += m.len;
        Some(m)
    } else {
        None
    };

    let r = modrm.map(|m| m.r);
    let kind = classify(opcode, escape_0x0f, r);

    let imm_size = imm_size_for(opcode, escape_0x0f, kind).resolve(prefixes.opsize_prefix);
    let imm = &code[pos..pos + imm_size];
    pos += imm_size;

    Ok(Decoded {
        prefixes,
        escape_0x0f,
        opcode,
        has_modrm,
        modrm,
        imm,
        kind,
        len: pos,
    })
}

fn has_modrm_for(opcode: u8, escape: bool) -> bool {
    if escape {
        // Two-byte opcodes: Jcc rel32 (0x80-0x8F) carry an immediate,
        // not a ModR/M. Everything else recognized here (currently
        // none) would need a case; default to false for the escape
        // table's control-flow-only coverage.
        return !(0x80..=0x8F).contains(&opcode);
    }
    match opcode {
        // push/pop reg, mov reg,imm32, inc/dec reg: no ModR/M.
        0x50..=0x5F | 0xB8..=0xBF | 0x40..=0x4F => false,
        // jmp/call rel32, jcc rel8, loop/jcxz rel8, int imm8, ret(n),
        // push imm32, test-set-of-no-modrm one-byte opcodes.
        0xE8 | 0xE9 | 0xEB | 0x70..=0x7F | 0xE0..=0xE3 | 0xCD | 0xC3 | 0xC2
        | 0x68 | 0x90 | 0x99 | 0x98 | 0xC9 | 0xCC => false,
        // ALU reg/rm forms, mov, lea, group opcodes (0xFF, 0xC6/C7,
        // 0x8C/0x8E) all carry a ModR/M byte.
        0x00..=0x3B | 0x84..=0x8E | 0xC6 | 0xC7 | 0xFF => true,
        _ => true,
    }
}

fn classify(opcode: u8, escape: bool, r: Option<u8>) -> InsnKind {
    if escape {
        return match opcode {
            0x80..=0x8F => InsnKind::Jcc { cc: opcode & 0x0F },
            0x00..=0x07 => InsnKind::Privileged, // descriptor-table group
            0x0B => InsnKind::Invalid,           // UD2
            _ => InsnKind::Unsupported,
        };
    }

    match opcode {
        0xE8 => InsnKind::CallDirect,
        0xE9 | 0xEB => InsnKind::JmpDirect,
        0xC3 => InsnKind::Ret,
        0xC2 => InsnKind::RetnImm16,
        0x70..=0x7F => InsnKind::Jcc { cc: opcode & 0x0F },
        0xE0..=0xE3 => InsnKind::JccRel8,
        0xCD => InsnKind::Int,
        0x8C => match r {
            Some(5) => InsnKind::MovFromSeg,
            _ => InsnKind::Unsupported,
        },
        0x8E => match r {
            Some(5) => InsnKind::MovToSeg,
            _ => InsnKind::Unsupported,
        },
        0xFF => match r {
            Some(2) => InsnKind::CallIndirect,
            Some(4) => InsnKind::JmpIndirect,
            Some(0) | Some(1) | Some(6) => InsnKind::Normal, // inc/dec/push [rm]
            _ => InsnKind::Unsupported,
        },
        // Privileged: HLT, CLI, STI, IN/OUT.
        0xF4 | 0xFA | 0xFB | 0xE4..=0xE7 | 0xEC..=0xEF => InsnKind::Privileged,
        // FPU/escape opcodes are out of scope for this core.
        0xD8..=0xDF => InsnKind::Unsupported,
        0x00..=0x3B | 0x40..=0x4F | 0x50..=0x5F | 0x68 | 0x84..=0x8B | 0x8D
        | 0x90 | 0x98 | 0x99 | 0xB8..=0xBF | 0xC6 | 0xC7 | 0xC9 | 0xCC => {
            InsnKind::Normal
        }
        _ => InsnKind::Unknown,
    }
}

fn imm_size_for(opcode: u8, escape: bool, kind: InsnKind) -> ImmSize {
    if escape {
        return match kind {
            InsnKind::Jcc { .. } => ImmSize::Imm32,
            _ => ImmSize::None,
        };
    }
    match kind {
        InsnKind::CallDirect | InsnKind::JmpDirect if opcode == 0xEB => ImmSize::Imm8,
        InsnKind::CallDirect | InsnKind::JmpDirect => ImmSize::Imm32,
        InsnKind::RetnImm16 => ImmSize::Imm16,
        InsnKind::Jcc { .. } if opcode <= 0x7F => ImmSize::Imm8,
        InsnKind::JccRel8 => ImmSize::Imm8,
        InsnKind::Int => ImmSize::Imm8,
        _ => match opcode {
            0x68 => ImmSize::OperandSize,
            0xB8..=0xBF => ImmSize::OperandSize,
            0xC6 => ImmSize::Imm8,
            0xC7 => ImmSize::OperandSize,
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => ImmSize::Imm8,
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => ImmSize::OperandSize,
            0x80 => ImmSize::Imm8,
            0x81 => ImmSize::OperandSize,
            0x83 => ImmSize::Imm8,
            _ => ImmSize::None,
        },
    }
}
