//! Paged virtual memory manager.
//!
//! Lays a 4 KiB-page protection model over a host that only allocates
//! at 64 KiB *block* granularity (the `HostPager` trait stands in for
//! a `VirtualAlloc`/`NtCreateSection`/`NtMapViewOfSection`-style host
//! API — see `pager` module doc). The VMM never knows about
//! guest instructions; `dbt-exec`/`linux-user` call into it from
//! syscall entries and the host's SIGSEGV handler.

pub mod map_list;
pub mod pager;
pub mod state;
pub mod sys;

pub use map_list::{FileBacking, MapEntry, MapList};
pub use pager::{LinuxPager, Section};
pub use state::{ForkOutcome, VmmState};
pub use sys::*;

/// Protection unit.
pub const PAGE_SIZE: u64 = 4096;
/// Host allocation unit: 16 pages per block.
pub const BLOCK_SIZE: u64 = 65536;
pub const PAGES_PER_BLOCK: u64 = BLOCK_SIZE / PAGE_SIZE;

/// Guest address window is `[0, 2^31)`.
pub const GUEST_ADDR_LIMIT: u64 = 1 << 31;
pub const PAGE_COUNT: usize = (GUEST_ADDR_LIMIT / PAGE_SIZE) as usize;
pub const BLOCK_COUNT: usize = (GUEST_ADDR_LIMIT / BLOCK_SIZE) as usize;

/// `[HEAP_BASE, ALLOC_LOW)` hosts the initial ELF image and `brk`
/// growth; `[ALLOC_LOW, ALLOC_HIGH)` is the general-purpose `mmap`
/// search range. `[ALLOC_HIGH, DBT_REGION_HIGH)` is the translator's
/// own fixed upper region and is never handed out by `mmap`.
pub const HEAP_BASE: u64 = 0x0400_0000;
pub const ALLOC_LOW: u64 = 0x1000_0000;
pub const ALLOC_HIGH: u64 = 0x7000_0000;
pub const DBT_REGION_LOW: u64 = 0x7000_0000;
pub const DBT_REGION_HIGH: u64 = 0x7200_0000;

/// Protection bits, shared between `page_prot` entries and the guest
/// `PROT_*` values passed to `sys_mprotect`/`sys_mmap`.
pub const PROT_READ: u8 = 1;
pub const PROT_WRITE: u8 = 2;
pub const PROT_EXEC: u8 = 4;

/// Linux `mmap`/`mmap2` guest flag bits this core recognizes; anything
/// else (notably `MAP_SHARED`) is rejected.
pub const MAP_SHARED: u32 = 0x01;
pub const MAP_PRIVATE: u32 = 0x02;
pub const MAP_FIXED: u32 = 0x10;
pub const MAP_ANONYMOUS: u32 = 0x20;
/// Non-standard flag bit requesting the `[HEAP_BASE,
/// ALLOC_LOW)` search range instead of the general one.
pub const __MAP_HEAP: u32 = 0x8000;

#[inline]
pub fn page_index(addr: u64) -> usize {
    (addr / PAGE_SIZE) as usize
}

#[inline]
pub fn block_index(addr: u64) -> usize {
    (addr / BLOCK_SIZE) as usize
}

#[inline]
pub fn block_base(block: usize) -> u64 {
    block as u64 * BLOCK_SIZE
}

#[inline]
pub fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub fn page_count_for(len: u64) -> u64 {
    page_align_up(len) / PAGE_SIZE
}

/// Translate a Linux `PROT_*` mask to the host protection the block's
/// section must carry. The host side here only has
/// `PROT_READ|PROT_WRITE|PROT_EXEC` to work with (Linux `mprotect`) —
/// see `pager` for how these feed `libc::mprotect`.
pub fn prot_linux_to_host(prot: u8) -> i32 {
    let mut host = 0;
    if prot & PROT_READ != 0 {
        host |= libc::PROT_READ;
    }
    if prot & PROT_WRITE != 0 {
        host |= libc::PROT_WRITE;
    }
    if prot & PROT_EXEC != 0 {
        host |= libc::PROT_EXEC;
    }
    host
}
