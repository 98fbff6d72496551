//! ELF32 image loading and initial stack layout. Process startup and
//! argv/env marshalling sit outside the translator core proper;
//! `linux-user` is where that layer lives, wired through `vmm`'s
//! `mmap`/`mprotect`/`brk`.

use std::fmt;
use std::fs;
use std::path::Path;

use vmm::{VmmState, ALLOC_HIGH, MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};

use crate::elf::*;
use crate::process;

#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Elf(ElfError),
    NoLoadSegment,
    SegmentOutOfRange,
    Map(i32),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O: {e}"),
            Self::Elf(e) => write!(f, "ELF: {e}"),
            Self::NoLoadSegment => write!(f, "no PT_LOAD segment"),
            Self::SegmentOutOfRange => write!(f, "segment out of range"),
            Self::Map(errno) => write!(f, "mmap/mprotect failed: errno {errno}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ElfError> for LoadError {
    fn from(e: ElfError) -> Self {
        Self::Elf(e)
    }
}

/// Stack sits just under the translator's own fixed upper region
/// (`[0x7000_0000, 0x7200_0000)`), with a guard gap so a runaway
/// stack can't walk straight into it unnoticed.
pub const GUEST_STACK_TOP: u32 = (ALLOC_HIGH - 0x10_0000) as u32;
pub const GUEST_STACK_SIZE: u32 = 8 * 1024 * 1024;

/// Result of loading an ELF binary.
pub struct ElfInfo {
    pub entry: u32,
    pub phdr_addr: u32,
    pub phnum: u16,
    pub sp: u32,
}

fn elf_to_prot(flags: u32) -> u8 {
    let mut prot = 0;
    if flags & PF_R != 0 {
        prot |= PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= PROT_EXEC;
    }
    prot
}

fn page_align_down(addr: u32) -> u32 {
    addr & !4095
}

fn page_align_up(addr: u32) -> u32 {
    (addr.wrapping_add(4095)) & !4095
}

/// Load a static 32-bit x86 ELF executable.
pub fn load_elf(
    path: &Path,
    vm: &mut VmmState,
    argv: &[&str],
    envp: &[&str],
) -> Result<ElfInfo, LoadError> {
    let data = fs::read(path)?;
    let ehdr = Elf32Ehdr::from_bytes(&data)?;
    ehdr.validate_i386()?;
    let phdrs = ehdr.program_headers(&data)?;

    let mut brk: u32 = 0;
    let mut has_load = false;
    let mut phdr_addr: u32 = 0;

    let mut first_load_vaddr: Option<u32> = None;
    for ph in phdrs {
        if ph.p_type == PT_PHDR {
            phdr_addr = ph.p_vaddr;
        }
        if ph.p_type == PT_LOAD && first_load_vaddr.is_none() {
            first_load_vaddr = Some(ph.p_vaddr);
        }
    }
    if phdr_addr == 0 {
        if let Some(base) = first_load_vaddr {
            phdr_addr = base + ehdr.e_phoff;
        }
    }

    for ph in phdrs {
        if ph.p_type != PT_LOAD {
            continue;
        }
        has_load = true;

        let aligned_start = page_align_down(ph.p_vaddr);
        let aligned_end = page_align_up(ph.p_vaddr.saturating_add(ph.p_memsz));
        let aligned_size = (aligned_end - aligned_start) as u64;

        if aligned_end > GUEST_STACK_TOP {
            return Err(LoadError::SegmentOutOfRange);
        }

        // Map RW first so the file content can be copied in, then
        // narrow to the segment's real permissions below.
        vm.mmap(
            aligned_start as u64,
            aligned_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
            None,
        )
        .map_err(LoadError::Map)?;

        if ph.p_filesz > 0 {
            let src_off = ph.p_offset as usize;
            let src_end = src_off + ph.p_filesz as usize;
            if src_end > data.len() {
                return Err(LoadError::Elf(ElfError::InvalidPhdr));
            }
            unsafe {
                process::write_bytes(ph.p_vaddr, &data[src_off..src_end]);
            }
        }

        let prot = elf_to_prot(ph.p_flags);
        if prot != (PROT_READ | PROT_WRITE) {
            vm.mprotect(aligned_start as u64, aligned_size, prot)
                .map_err(LoadError::Map)?;
        }

        let seg_end = page_align_up(ph.p_vaddr.saturating_add(ph.p_memsz));
        if seg_end > brk {
            brk = seg_end;
        }
    }

    if !has_load {
        return Err(LoadError::NoLoadSegment);
    }

    vm.set_initial_brk(brk as u64);

    let execfn = path.to_string_lossy();
    let sp = setup_stack(vm, ehdr.e_entry, phdr_addr, ehdr.e_phnum, argv, envp, execfn.as_ref())?;

    Ok(ElfInfo {
        entry: ehdr.e_entry,
        phdr_addr,
        phnum: ehdr.e_phnum,
        sp,
    })
}

/// Build the initial stack per the classic i386 Linux ABI: argc, argv
/// pointers, a NULL, envp pointers, a NULL, then the auxiliary vector,
/// all 4-byte entries (no 8-byte alignment requirement as on LP64).
#[allow(clippy::too_many_arguments)]
fn setup_stack(
    vm: &mut VmmState,
    entry: u32,
    phdr_addr: u32,
    phnum: u16,
    argv: &[&str],
    envp: &[&str],
    execfn: &str,
) -> Result<u32, LoadError> {
    let stack_top = GUEST_STACK_TOP;
    let stack_base = stack_top - GUEST_STACK_SIZE;

    vm.mmap(
        stack_base as u64,
        GUEST_STACK_SIZE as u64,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
        None,
    )
    .map_err(LoadError::Map)?;

    let mut pos = stack_top;

    pos -= 16;
    let random_addr = pos;
    let random_data: [u8; 16] = [
        0xde, 0xad, 0xbe, 0xef, 0xca, 0xfe, 0xba, 0xbe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd,
        0xef,
    ];
    unsafe {
        process::write_bytes(random_addr, &random_data);
    }

    let execfn_bytes = execfn.as_bytes();
    pos -= (execfn_bytes.len() + 1) as u32;
    let execfn_addr = pos;
    unsafe {
        process::write_bytes(execfn_addr, execfn_bytes);
    }

    let mut envp_addrs = Vec::with_capacity(envp.len());
    for &s in envp.iter().rev() {
        let bytes = s.as_bytes();
        pos -= (bytes.len() + 1) as u32;
        envp_addrs.push(pos);
        unsafe {
            process::write_bytes(pos, bytes);
        }
    }
    envp_addrs.reverse();

    let mut argv_addrs = Vec::with_capacity(argv.len());
    for &s in argv.iter().rev() {
        let bytes = s.as_bytes();
        pos -= (bytes.len() + 1) as u32;
        argv_addrs.push(pos);
        unsafe {
            process::write_bytes(pos, bytes);
        }
    }
    argv_addrs.reverse();

    pos &= !15;

    let auxv: [(u32, u32); 8] = [
        (AT_PHDR, phdr_addr),
        (AT_PHENT, std::mem::size_of::<Elf32Phdr>() as u32),
        (AT_PHNUM, phnum as u32),
        (AT_PAGESZ, 4096),
        (AT_ENTRY, entry),
        (AT_RANDOM, random_addr),
        (AT_EXECFN, execfn_addr),
        (AT_NULL, 0),
    ];

    let argc = argv.len();
    let envc = envp.len();
    let frame_u32s = 1 + argc + 1 + envc + 1 + auxv.len() * 2;
    pos -= (frame_u32s * 4) as u32;
    pos &= !15;

    let sp = pos;
    let mut cur = sp;

    unsafe { process::write_u32(cur, argc as u32) };
    cur += 4;

    for &addr in &argv_addrs {
        unsafe { process::write_u32(cur, addr) };
        cur += 4;
    }
    unsafe { process::write_u32(cur, 0) };
    cur += 4;

    for &addr in &envp_addrs {
        unsafe { process::write_u32(cur, addr) };
        cur += 4;
    }
    unsafe { process::write_u32(cur, 0) };
    cur += 4;

    for (typ, val) in auxv {
        unsafe {
            process::write_u32(cur, typ);
            process::write_u32(cur + 4, val);
        }
        cur += 8;
    }

    Ok(sp)
}
