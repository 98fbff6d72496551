//! Cross-crate ELF loading and initial-stack layout, the classic i386
//! Linux process-startup ABI: a synthetic static ELF32
//! image is loaded through `dbt_linux_user::load_elf` against a real
//! `vmm::VmmState`, then the resulting stack/entry/brk are checked the
//! way a libc `_start` would actually read them.

use std::fs;
use std::io::Write;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use dbt_linux_user::{load_elf, ElfInfo, AT_NULL, AT_PHDR, EM_386, ET_EXEC, PF_R, PF_X, PT_LOAD};
use vmm::VmmState;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Classic static-binary load address `ld` has used for i386 since
/// forever (`0x08048000`), picked here purely for realism.
const LOAD_VADDR: u32 = 0x0804_8000;

#[repr(C)]
struct Elf32EhdrRaw {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
struct Elf32PhdrRaw {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

/// Builds a minimal valid ET_EXEC ELF32/i386 image: one PT_LOAD
/// segment covering a handful of `nop`s terminated by `ret`.
fn make_minimal_elf() -> Vec<u8> {
    let ehdr_sz = mem::size_of::<Elf32EhdrRaw>();
    let phdr_sz = mem::size_of::<Elf32PhdrRaw>();
    let code: [u8; 4] = [0x90, 0x90, 0x90, 0xC3]; // nop; nop; nop; ret
    let code_offset = ehdr_sz + phdr_sz;

    let mut e_ident = [0u8; 16];
    e_ident[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    e_ident[4] = 1; // ELFCLASS32
    e_ident[5] = 1; // ELFDATA2LSB
    e_ident[6] = 1; // EV_CURRENT

    let ehdr = Elf32EhdrRaw {
        e_ident,
        e_type: ET_EXEC,
        e_machine: EM_386,
        e_version: 1,
        e_entry: LOAD_VADDR,
        e_phoff: ehdr_sz as u32,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: ehdr_sz as u16,
        e_phentsize: phdr_sz as u16,
        e_phnum: 1,
        e_shentsize: 0,
        e_shnum: 0,
        e_shstrndx: 0,
    };
    let phdr = Elf32PhdrRaw {
        p_type: PT_LOAD,
        p_offset: code_offset as u32,
        p_vaddr: LOAD_VADDR,
        p_paddr: LOAD_VADDR,
        p_filesz: code.len() as u32,
        p_memsz: code.len() as u32,
        p_flags: PF_R | PF_X,
        p_align: 4096,
    };

    let mut buf = Vec::with_capacity(code_offset + code.len());
    // SAFETY: both structs are repr(C), POD, and exactly `size_of`
    // bytes long; this is the same pattern the ELF reader itself uses
    // in reverse (`Elf32Ehdr::from_bytes`).
    unsafe {
        buf.extend_from_slice(std::slice::from_raw_parts(
            &ehdr as *const Elf32EhdrRaw as *const u8,
            ehdr_sz,
        ));
        buf.extend_from_slice(std::slice::from_raw_parts(
            &phdr as *const Elf32PhdrRaw as *const u8,
            phdr_sz,
        ));
    }
    buf.extend_from_slice(&code);
    buf
}

struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn write_temp_elf(data: &[u8]) -> TempFile {
    let pid = std::process::id();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = PathBuf::from(format!("/tmp/dbt_test_elf_{pid}_{n}.bin"));
    let mut f = fs::File::create(&path).unwrap();
    f.write_all(data).unwrap();
    TempFile(path)
}

unsafe fn read_u32_at(addr: u32) -> u32 {
    (addr as usize as *const u32).read_unaligned()
}

unsafe fn read_cstr_at(addr: u32) -> String {
    let mut bytes = Vec::new();
    let mut p = addr as usize as *const u8;
    loop {
        let b = *p;
        if b == 0 {
            break;
        }
        bytes.push(b);
        p = p.add(1);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[test]
fn load_elf_sets_entry_and_aligned_sp() {
    let _guard = crate::real_address_space_guard();
    let elf = make_minimal_elf();
    let tmp = write_temp_elf(&elf);
    let mut vm = VmmState::new().unwrap();

    let info: ElfInfo = load_elf(&tmp.0, &mut vm, &["/bin/prog"], &["HOME=/root"]).unwrap();

    assert_eq!(info.entry, LOAD_VADDR);
    assert_eq!(info.sp % 16, 0, "initial sp must be 16-byte aligned");
    assert!(info.sp < vmm::ALLOC_HIGH as u32);

    let code_bytes = unsafe {
        std::slice::from_raw_parts(LOAD_VADDR as usize as *const u8, 4)
    };
    assert_eq!(code_bytes, &[0x90, 0x90, 0x90, 0xC3]);
}

#[test]
fn load_elf_builds_argc_argv_and_terminated_auxv() {
    let _guard = crate::real_address_space_guard();
    let elf = make_minimal_elf();
    let tmp = write_temp_elf(&elf);
    let mut vm = VmmState::new().unwrap();

    let info = load_elf(&tmp.0, &mut vm, &["/bin/prog", "hello"], &[]).unwrap();

    let argc = unsafe { read_u32_at(info.sp) };
    assert_eq!(argc, 2);

    let argv0_ptr = unsafe { read_u32_at(info.sp + 4) };
    let argv1_ptr = unsafe { read_u32_at(info.sp + 8) };
    assert_eq!(unsafe { read_cstr_at(argv0_ptr) }, "/bin/prog");
    assert_eq!(unsafe { read_cstr_at(argv1_ptr) }, "hello");

    // argv is NULL-terminated right after the last entry.
    let argv_terminator = unsafe { read_u32_at(info.sp + 12) };
    assert_eq!(argv_terminator, 0);

    // envp is empty here, so its terminating NULL sits right after argv's.
    let envp_terminator = unsafe { read_u32_at(info.sp + 16) };
    assert_eq!(envp_terminator, 0);

    // Walk forward from just past argv/envp NULs looking for AT_PHDR,
    // confirming the auxv entries are well-formed key/value pairs.
    let mut cursor = info.sp + 20;
    let mut saw_at_phdr = false;
    let mut saw_at_null = false;
    for _ in 0..16 {
        let key = unsafe { read_u32_at(cursor) };
        let val = unsafe { read_u32_at(cursor + 4) };
        if key == AT_PHDR {
            assert_eq!(val, info.phdr_addr);
            saw_at_phdr = true;
        }
        if key == AT_NULL {
            saw_at_null = true;
            break;
        }
        cursor += 8;
    }
    assert!(saw_at_phdr);
    assert!(saw_at_null);
}
