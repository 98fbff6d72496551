//! x86 instruction decoding: legacy prefixes, one- and two-byte opcode
//! dispatch, and ModR/M + SIB parsing. The decoder classifies each
//! instruction into the category the translator (`dbt-translate`)
//! dispatches on; it does not itself rewrite or emit anything.

pub mod insn;
pub mod modrm;
pub mod prefix;

pub use insn::{decode, Decoded, DecodeError, ImmSize, InsnKind};
pub use modrm::{parse_modrm, ModRm, Rm};
pub use prefix::{consume_prefixes, FatalPrefix, Prefixes, FATAL_PREFIXES};
