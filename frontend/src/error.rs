//! Translator-fatal conditions: unknown/invalid/privileged/
//! unsupported opcodes and unsupported prefixes. These are
//! implementation limits, not guest errors: the expected response is
//! to break into the debugger and abort, which in Rust is an
//! implementation-limit panic rather than a recoverable `Result`.

use dbt_decode::InsnKind;

pub fn fatal_opcode(pc: u32, opcode: u8, kind: InsnKind) -> ! {
    eprintln!("[dbt] fatal opcode {opcode:#04x} ({kind:?}) at guest pc {pc:#010x}");
    panic!("translator hit an unsupported/invalid/privileged opcode");
}

pub fn fatal_prefix(pc: u32, byte: u8) -> ! {
    eprintln!("[dbt] fatal prefix {byte:#04x} at guest pc {pc:#010x}");
    panic!("translator hit an unsupported prefix");
}
