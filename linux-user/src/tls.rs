//! `fs`-segment TLS setup backing the translator's emulated-GS
//! rewrites (`MovFromSeg`/`MovToSeg`). TLS slot allocation sits outside
//! the translator core proper, reached only through `tls_alloc`/
//! `tls_slot_to_offset`; this module is that layer on Linux/i386.
//!
//! `dbt-translate` emits `fs:[off]` loads/stores for its three GS-
//! emulation slots instead of a real segment-register switch, so
//! `install` gives the real `fs` register a base address that points at
//! a fixed header plus a small table of resolved TLS-entry base
//! addresses, and `tls_alloc` is how `SYS_SET_THREAD_AREA` emulation
//! populates that table.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use dbt_translate::GsSlots;

const SYS_SET_THREAD_AREA: i64 = 243;

/// Mirrors the kernel's `struct user_desc` (`asm/ldt.h`): the trailing
/// bitfields collapse into one `u32` here since we only ever set a
/// fixed combination (32-bit, writable data segment, present, usable).
#[repr(C)]
struct UserDesc {
    entry_number: u32,
    base_addr: u32,
    limit: u32,
    flags: u32,
}

/// `seg_32bit=1, contents=0 (data), read_exec_only=0, limit_in_pages=0,
/// seg_not_present=0, useable=1`.
const USER_DESC_FLAGS: u32 = 0b0100_0001;

/// The header words the translator addresses directly through
/// `GsSlots`, followed by one resolved thread-base address per TLS
/// entry in `dbt_core::TLS_ENTRY_MIN..+TLS_ENTRY_COUNT`, addressed only
/// through `tls_slot_to_offset`. Leaked for the process lifetime — one
/// per `dbt-ia32` process, never freed.
#[repr(C)]
struct TlsBlock {
    scratch: u32,
    gs: u32,
    gs_addr: u32,
    slots: [u32; dbt_core::TLS_ENTRY_COUNT as usize],
}

static TLS_BLOCK: AtomicPtr<TlsBlock> = AtomicPtr::new(std::ptr::null_mut());
static NEXT_ENTRY: AtomicU32 = AtomicU32::new(dbt_core::TLS_ENTRY_MIN);

/// Installs a GDT entry pointing `fs` at a fresh [`TlsBlock`] and loads
/// the resulting selector into the real `fs` register, returning the
/// slot offsets the translator's code generator should use.
pub fn install() -> io::Result<GsSlots> {
    let block = Box::leak(Box::new(TlsBlock {
        scratch: 0,
        gs: 0,
        gs_addr: 0,
        slots: [0; dbt_core::TLS_ENTRY_COUNT as usize],
    }));
    TLS_BLOCK.store(block as *mut TlsBlock, Ordering::Relaxed);

    let mut desc = UserDesc {
        entry_number: u32::MAX,
        base_addr: block as *mut TlsBlock as u32,
        limit: mem::size_of::<TlsBlock>() as u32,
        flags: USER_DESC_FLAGS,
    };

    // SAFETY: `desc` is a valid, fully-initialized `user_desc`; the
    // kernel only reads it and writes back `entry_number`.
    let ret = unsafe { libc::syscall(SYS_SET_THREAD_AREA, &mut desc as *mut UserDesc) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    // GDT selector: index<<3 | RPL=3 | TI=0 (GDT, not LDT).
    let selector: u16 = ((desc.entry_number as u16) << 3) | 3;
    // SAFETY: loading a freshly-allocated GDT data-segment selector
    // into `fs` is exactly what `set_thread_area` exists to support.
    unsafe {
        std::arch::asm!("mov fs, {0:x}", in(reg) selector);
    }

    Ok(GsSlots {
        scratch_offset: 0,
        gs_offset: mem::size_of::<u32>() as i32,
        gs_addr_offset: (2 * mem::size_of::<u32>()) as i32,
    })
}

/// Guest-facing half of `SYS_SET_THREAD_AREA`: assigns (or reuses, if
/// `requested_entry` already names a valid one) a TLS entry number and
/// stores `base_addr` where `tls_slot_to_offset(entry)` will later
/// resolve it from translated `MOV_TO_SEG` code. Returns the entry
/// number, which the caller writes back into the guest's `user_desc`.
pub fn tls_alloc(requested_entry: Option<u32>, base_addr: u32) -> io::Result<u32> {
    let block = TLS_BLOCK.load(Ordering::Relaxed);
    if block.is_null() {
        return Err(io::Error::new(io::ErrorKind::Other, "tls_alloc called before install"));
    }

    let min = dbt_core::TLS_ENTRY_MIN;
    let count = dbt_core::TLS_ENTRY_COUNT;
    let entry = match requested_entry {
        Some(e) if (min..min + count).contains(&e) => e,
        _ => {
            let e = NEXT_ENTRY.fetch_add(1, Ordering::Relaxed);
            if e >= min + count {
                NEXT_ENTRY.store(min + 1, Ordering::Relaxed);
                min
            } else {
                e
            }
        }
    };

    let idx = (entry - min) as usize;
    // SAFETY: `block` was leaked by `install` and lives for the process;
    // `idx` is bounds-checked by the match above.
    unsafe {
        (*block).slots[idx] = base_addr;
    }
    Ok(entry)
}
