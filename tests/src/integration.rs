//! End-to-end scenarios that cross every crate boundary at once: a
//! real ELF image loaded through `vmm`/`dbt-linux-user`, its entry
//! block translated through `dbt-translate`/`dbt-core`/`dbt-emit`
//! exactly the way `dbt-exec`'s dispatcher would, and a hand-built
//! direct-jump pair checked against the emitted bytes rather than just
//! the translator's own unit-level byte patterns.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use dbt_core::BlockPool;
use dbt_emit::CodeBuffer;
use dbt_linux_user::{load_elf, ProcessMemory};
use dbt_translate::{translate_block, DispatchTargets, GsSlots, GuestMemory};
use vmm::VmmState;

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn targets() -> DispatchTargets {
    DispatchTargets {
        find_direct_internal: 0x1000_0000,
        find_indirect_internal: 0x1000_1000,
        syscall_entry: 0x1000_2000,
        tls_slot_to_offset_internal: 0x1000_3000,
    }
}

fn gs() -> GsSlots {
    GsSlots {
        scratch_offset: 0x10,
        gs_offset: 0x14,
        gs_addr_offset: 0x18,
    }
}

/// A `jmp` whose target is already translated must link straight to
/// that block's `cache_start` with no trampoline in between.
#[test]
fn direct_jump_to_an_already_translated_block_skips_the_trampoline() {
    let mut mem = vec![0u8; 0x20];
    // Block B at +0x10: a lone `ret`.
    mem[0x10] = 0xC3;
    // Block A at +0x00: `jmp rel8 +14` lands on block B (0x02 + 14 = 0x10).
    mem[0x00] = 0xEB;
    mem[0x01] = 14;

    struct FlatMem {
        bytes: Vec<u8>,
        base: u32,
    }
    impl GuestMemory for FlatMem {
        fn bytes_at(&self, pc: u32) -> &[u8] {
            &self.bytes[(pc - self.base) as usize..]
        }
    }
    let base = 0x2000_0000u32;
    let mem = FlatMem { bytes: mem, base };

    let mut pool = BlockPool::new(16);
    let mut buf = CodeBuffer::new(1 << 20).unwrap();

    // Translate B first so A's jmp finds it already resident.
    let b_idx = translate_block(&mut pool, &mut buf, &mem, base + 0x10, targets(), gs()).unwrap();
    let b_start = pool.get(b_idx).cache_start;

    let a_idx = translate_block(&mut pool, &mut buf, &mem, base, targets(), gs()).unwrap();
    let a_start = pool.get(a_idx).cache_start;

    let bytes = buf.read(a_start, 5);
    assert_eq!(bytes[0], 0xE9, "jmp rel32 opcode");
    let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let patched_target = (a_start as i64 + 1 + 4 + disp as i64) as usize;
    assert_eq!(patched_target, b_start, "jmp must land directly on B's cache_start, not a trampoline");
}

static ELF_COUNTER: AtomicU32 = AtomicU32::new(0);
const LOAD_VADDR: u32 = 0x0804_8000;

struct TempFile(PathBuf);
impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// `mov eax, 1; mov ebx, 42; int 0x80; ret` — enough for the entry
/// block to exercise `Normal`, `Int` (continues the block) and `Ret`.
fn make_elf_with_syscall_entry() -> Vec<u8> {
    #[repr(C)]
    struct Ehdr {
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
    struct Phdr {
        p_type: u32,
        p_offset: u32,
        p_vaddr: u32,
        p_paddr: u32,
        p_filesz: u32,
        p_memsz: u32,
        p_flags: u32,
        p_align: u32,
    }

    let ehdr_sz = std::mem::size_of::<Ehdr>();
    let phdr_sz = std::mem::size_of::<Phdr>();
    let mut code = Vec::new();
    code.push(0xB8);
    code.extend_from_slice(&1u32.to_le_bytes()); // mov eax, 1
    code.push(0xBB);
    code.extend_from_slice(&42u32.to_le_bytes()); // mov ebx, 42
    code.push(0xCD);
    code.push(0x80); // int 0x80
    code.push(0xC3); // ret
    let code_offset = ehdr_sz + phdr_sz;

    let mut e_ident = [0u8; 16];
    e_ident[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    e_ident[4] = 1;
    e_ident[5] = 1;
    e_ident[6] = 1;

    let ehdr = Ehdr {
        e_ident,
        e_type: dbt_linux_user::ET_EXEC,
        e_machine: dbt_linux_user::EM_386,
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
    let phdr = Phdr {
        p_type: dbt_linux_user::PT_LOAD,
        p_offset: code_offset as u32,
        p_vaddr: LOAD_VADDR,
        p_paddr: LOAD_VADDR,
        p_filesz: code.len() as u32,
        p_memsz: code.len() as u32,
        p_flags: dbt_linux_user::PF_R | dbt_linux_user::PF_X,
        p_align: 4096,
    };

    let mut buf = Vec::with_capacity(code_offset + code.len());
    unsafe {
        buf.extend_from_slice(std::slice::from_raw_parts(&ehdr as *const Ehdr as *const u8, ehdr_sz));
        buf.extend_from_slice(std::slice::from_raw_parts(&phdr as *const Phdr as *const u8, phdr_sz));
    }
    buf.extend_from_slice(&code);
    buf
}

/// Loads a real image through `vmm`/`dbt-linux-user`, then translates
/// its entry block through the real `dbt-translate`/`dbt-core`/
/// `dbt-emit` pipeline reading the real mapped bytes via
/// `ProcessMemory` — nothing about the guest code is synthesized past
/// the ELF file itself.
#[test]
fn loaded_elf_entry_block_translates_through_process_memory() {
    let _guard = crate::real_address_space_guard();

    let elf = make_elf_with_syscall_entry();
    let pid = std::process::id();
    let n = ELF_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = PathBuf::from(format!("/tmp/dbt_integration_elf_{pid}_{n}.bin"));
    let mut f = fs::File::create(&path).unwrap();
    f.write_all(&elf).unwrap();
    let tmp = TempFile(path);

    let mut vm = VmmState::new().unwrap();
    let info = load_elf(&tmp.0, &mut vm, &["/bin/prog"], &[]).unwrap();
    assert_eq!(info.entry, LOAD_VADDR);

    let mem = ProcessMemory;
    let mut pool = BlockPool::new(16);
    let mut buf = CodeBuffer::new(1 << 20).unwrap();
    let idx = translate_block(&mut pool, &mut buf, &mem, info.entry, targets(), gs()).unwrap();
    let b = pool.get(idx);
    assert_eq!(b.guest_pc, LOAD_VADDR);

    // `int 0x80` continues the block, so the 20 emitted
    // bytes are: mov eax,1 ; mov ebx,42 ; call syscall_entry ; jmp
    // find_indirect_internal (emitted for the trailing `ret`).
    let tail = buf.read(b.cache_start, 20);
    assert_eq!(&tail[0..5], &[0xB8, 1, 0, 0, 0], "mov eax, 1 copied through verbatim");
    assert_eq!(&tail[5..10], &[0xBB, 42, 0, 0, 0], "mov ebx, 42 copied through verbatim");

    assert_eq!(tail[10], 0xE8, "int 0x80 lowers to a call into the syscall entry point");
    let call_disp = i32::from_le_bytes([tail[11], tail[12], tail[13], tail[14]]);
    let call_site = b.cache_start + 10;
    assert_eq!((call_site as i64 + 5 + call_disp as i64) as usize, targets().syscall_entry);

    assert_eq!(tail[15], 0xE9, "the trailing ret lowers to a jmp into the indirect dispatcher");
    let jmp_disp = i32::from_le_bytes([tail[16], tail[17], tail[18], tail[19]]);
    let jmp_site = b.cache_start + 15;
    assert_eq!((jmp_site as i64 + 5 + jmp_disp as i64) as usize, targets().find_indirect_internal);
}
