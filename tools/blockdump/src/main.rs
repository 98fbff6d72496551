//! blockdump — static ELF32/i386 -> instruction-by-instruction dump.
//!
//! Reads a 32-bit x86 ELF binary, walks its executable segments one
//! basic block at a time using the same decode tables the translator
//! dispatches on, and prints each instruction's address, raw bytes and
//! decoded category. Debugging aid only; it never emits host code or
//! touches the real code cache.

use std::env;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::process;

use dbt_decode::{decode, DecodeError, InsnKind};
use dbt_linux_user::{Elf32Ehdr, Elf32Phdr, PF_X};

struct Args {
    elf_path: String,
    output: Option<String>,
    start: Option<u32>,
    count: Option<usize>,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "usage: blockdump <elf> [options]\n\
             \n\
             Options:\n  \
               -o <file>      Output to file\n  \
               --start <hex>  Start address (default: entry point)\n  \
               --count <n>    Max instructions to print"
        );
        process::exit(1);
    }

    let mut a = Args {
        elf_path: args[1].clone(),
        output: None,
        start: None,
        count: None,
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "-o" => {
                i += 1;
                a.output = Some(args[i].clone());
            }
            "--start" => {
                i += 1;
                let s = args[i].trim_start_matches("0x");
                a.start = Some(u32::from_str_radix(s, 16).expect("invalid hex address"));
            }
            "--count" => {
                i += 1;
                a.count = Some(args[i].parse().expect("invalid count"));
            }
            other => {
                eprintln!("unknown option: {other}");
                process::exit(1);
            }
        }
        i += 1;
    }
    a
}

struct Segment {
    vaddr: u32,
    data: Vec<u8>,
}

/// Flattens every executable PT_LOAD segment into one guest-address-
/// indexed byte image (gaps between segments read as zero).
fn build_image(data: &[u8]) -> (u32, Vec<u8>) {
    let ehdr = Elf32Ehdr::from_bytes(data).unwrap_or_else(|e| {
        eprintln!("ELF parse error: {e}");
        process::exit(1);
    });
    ehdr.validate_i386().unwrap_or_else(|e| {
        eprintln!("ELF parse error: {e}");
        process::exit(1);
    });
    let phdrs = ehdr.program_headers(data).unwrap_or_else(|e| {
        eprintln!("ELF parse error: {e}");
        process::exit(1);
    });

    let exec_segs: Vec<&Elf32Phdr> = phdrs
        .iter()
        .filter(|p| p.p_type == dbt_linux_user::PT_LOAD && p.p_flags & PF_X != 0)
        .collect();
    if exec_segs.is_empty() {
        eprintln!("no executable segments found");
        process::exit(1);
    }

    let lo = exec_segs.iter().map(|s| s.p_vaddr).min().unwrap();
    let hi = exec_segs.iter().map(|s| s.p_vaddr + s.p_memsz).max().unwrap();

    let segments: Vec<Segment> = exec_segs
        .iter()
        .map(|p| {
            let off = p.p_offset as usize;
            let filesz = p.p_filesz as usize;
            Segment {
                vaddr: p.p_vaddr,
                data: data[off..off + filesz].to_vec(),
            }
        })
        .collect();

    let mut image = vec![0u8; (hi - lo) as usize];
    for seg in &segments {
        let start = (seg.vaddr - lo) as usize;
        image[start..start + seg.data.len()].copy_from_slice(&seg.data);
    }
    (lo, image)
}

fn kind_mnemonic(kind: InsnKind, imm: &[u8]) -> String {
    match kind {
        InsnKind::Normal => "normal".to_string(),
        InsnKind::CallDirect => "call".to_string(),
        InsnKind::CallIndirect => "call indirect".to_string(),
        InsnKind::Ret => "ret".to_string(),
        InsnKind::RetnImm16 => {
            let n = u16::from_le_bytes([imm[0], imm[1]]);
            format!("ret {n:#x}")
        }
        InsnKind::JmpDirect => "jmp".to_string(),
        InsnKind::JmpIndirect => "jmp indirect".to_string(),
        InsnKind::Jcc { cc } => format!("jcc {cc:#x}"),
        InsnKind::JccRel8 => "jcc (rel8 triple-jmp form)".to_string(),
        InsnKind::Int => "int".to_string(),
        InsnKind::MovFromSeg => "mov r/m, gs".to_string(),
        InsnKind::MovToSeg => "mov gs, r/m".to_string(),
        InsnKind::Unknown => "??? (unknown)".to_string(),
        InsnKind::Invalid => "(invalid)".to_string(),
        InsnKind::Privileged => "(privileged)".to_string(),
        InsnKind::Unsupported => "(unsupported)".to_string(),
    }
}

/// Resolves the absolute guest target of a direct control-transfer
/// instruction, mirroring `dbt-translate`'s own `read_rel`.
fn direct_target(pc: u32, len: usize, imm: &[u8]) -> Option<u32> {
    let rel = match imm.len() {
        1 => imm[0] as i8 as i32,
        4 => i32::from_le_bytes(imm.try_into().unwrap()),
        _ => return None,
    };
    Some(pc.wrapping_add(len as u32).wrapping_add(rel as u32))
}

fn main() {
    let args = parse_args();

    let data = fs::read(&args.elf_path).unwrap_or_else(|e| {
        let p = &args.elf_path;
        eprintln!("failed to read {p}: {e}");
        process::exit(1);
    });

    let ehdr_entry = Elf32Ehdr::from_bytes(&data).map(|e| e.e_entry).unwrap_or(0);
    let (base, image) = build_image(&data);
    let image_end = base + image.len() as u32;

    let mut pc = args.start.unwrap_or(ehdr_entry);
    let max_count = args.count.unwrap_or(usize::MAX);

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => {
            let f = fs::File::create(path).unwrap_or_else(|e| {
                eprintln!("cannot create {path}: {e}");
                process::exit(1);
            });
            Box::new(BufWriter::new(f))
        }
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut printed = 0;
    while printed < max_count && pc < image_end {
        let off = (pc - base) as usize;
        let code = &image[off..];
        let d = match decode(code) {
            Ok(d) => d,
            Err(DecodeError::FatalPrefix(b)) => {
                writeln!(out, "{pc:08x}:  {b:02x}              (fatal prefix)").unwrap();
                break;
            }
        };

        let raw: Vec<String> = code[..d.len].iter().map(|b| format!("{b:02x}")).collect();
        let mut line = format!("{pc:08x}:  {:<24}  {}", raw.join(" "), kind_mnemonic(d.kind, d.imm));
        if matches!(d.kind, InsnKind::CallDirect | InsnKind::JmpDirect | InsnKind::Jcc { .. }) {
            if let Some(target) = direct_target(pc, d.len, d.imm) {
                line.push_str(&format!("  -> {target:#010x}"));
            }
        }
        writeln!(out, "{line}").unwrap();

        printed += 1;
        let terminates = matches!(
            d.kind,
            InsnKind::CallIndirect
                | InsnKind::Ret
                | InsnKind::RetnImm16
                | InsnKind::JmpDirect
                | InsnKind::JmpIndirect
                | InsnKind::Jcc { .. }
                | InsnKind::JccRel8
        );
        pc = pc.wrapping_add(d.len as u32);
        if terminates {
            writeln!(out).unwrap();
        }
    }
}
