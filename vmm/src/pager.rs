//! Host-API abstraction over the handful of primitives the VMM needs
//! from the underlying OS to back a block with a shareable, mappable
//! object.
//!
//! A block's backing is a 64 KiB host section capable of being mapped
//! into more than one process — the substrate fork's copy-on-write
//! story needs. This workspace targets a Linux host (`libc`, no
//! Windows-specific crate in the dependency graph — see DESIGN.md), so
//! `HostPager` plays the role a section-object API would on a host
//! that exposes one natively: the rest of `vmm` (`state.rs`) only
//! calls through this trait, never `libc` directly, so a different
//! host's pager can be dropped in without touching mapping/COW/fork
//! logic.
//!
//! A block's "section" is a `memfd_create` file mapped `MAP_SHARED` at
//! its canonical guest address. Owner counts have no Linux-native
//! equivalent that tracks "how many processes have this fd mapped", so
//! they're tracked explicitly in a `MAP_SHARED|MAP_ANON` counter array
//! that (unlike the rest of this process's memory) stays genuinely
//! shared, not copy-on-write, across `fork`.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{block_base, BLOCK_COUNT, BLOCK_SIZE};

/// Opaque handle to a block's shareable host section. `None`/absent
/// entries in `VmmState::block_section` mean the block has no live
/// section.
pub struct Section {
    pub(crate) fd: RawFd,
    pub(crate) block: usize,
}

pub trait HostPager: Send {
    /// Create a fresh `BLOCK_SIZE` section and map it at the block's
    /// canonical address with `prot`.
    fn create_and_map(&mut self, block: usize, prot: i32) -> io::Result<Section>;
    /// Unmap (but do not close) the section currently mapped at
    /// `block`'s canonical address.
    fn unmap_at(&mut self, block: usize) -> io::Result<()>;
    /// Close the section's underlying handle. Caller must have already
    /// unmapped every view of it.
    fn close(&mut self, sec: Section);
    /// Reapply host protection to the pages `[page_off, page_off +
    /// count)` within `block`.
    fn protect(&mut self, block: usize, page_off: usize, count: usize, prot: i32) -> io::Result<()>;
    /// Duplicate `src`'s contents into a freshly created section and
    /// swap it in at `block`'s canonical address. Returns the new
    /// section; `src` is left mapped nowhere (caller must `close` it).
    fn duplicate(&mut self, src: &Section, block: usize) -> io::Result<Section>;
    /// Number of processes currently holding this section mapped.
    fn owner_count(&self, sec: &Section) -> u32;
    fn inc_owner(&mut self, sec: &Section);
    /// Decrements and returns the new count.
    fn dec_owner(&mut self, sec: &Section) -> u32;
}

/// `libc`-backed `HostPager` for a Linux host.
pub struct LinuxPager {
    /// `MAP_SHARED|MAP_ANON` counters, one `u32` per block, genuinely
    /// shared (not COW) with any `fork`ed child.
    owner_counts: *mut AtomicU32,
}

// SAFETY: `owner_counts` points at a `MAP_SHARED` page; all access goes
// through `AtomicU32`.
unsafe impl Send for LinuxPager {}

impl LinuxPager {
    pub fn new() -> io::Result<Self> {
        let len = BLOCK_COUNT * std::mem::size_of::<AtomicU32>();
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { owner_counts: ptr as *mut AtomicU32 })
    }

    fn counter(&self, block: usize) -> &AtomicU32 {
        debug_assert!(block < BLOCK_COUNT);
        unsafe { &*self.owner_counts.add(block) }
    }

    fn new_memfd() -> io::Result<RawFd> {
        let name = b"dbt-block\0";
        let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, BLOCK_SIZE as libc::off_t) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(fd)
    }

    fn map_fixed(fd: RawFd, addr: u64, prot: i32) -> io::Result<()> {
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                BLOCK_SIZE as usize,
                prot,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl HostPager for LinuxPager {
    fn create_and_map(&mut self, block: usize, prot: i32) -> io::Result<Section> {
        let fd = Self::new_memfd()?;
        if let Err(e) = Self::map_fixed(fd, block_base(block), prot) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        self.counter(block).store(1, Ordering::SeqCst);
        Ok(Section { fd, block })
    }

    fn unmap_at(&mut self, block: usize) -> io::Result<()> {
        let ret = unsafe {
            libc::munmap(block_base(block) as *mut libc::c_void, BLOCK_SIZE as usize)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close(&mut self, sec: Section) {
        unsafe { libc::close(sec.fd) };
    }

    fn protect(&mut self, block: usize, page_off: usize, count: usize, prot: i32) -> io::Result<()> {
        let addr = block_base(block) + page_off as u64 * crate::PAGE_SIZE;
        let len = count * crate::PAGE_SIZE as usize;
        let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn duplicate(&mut self, src: &Section, block: usize) -> io::Result<Section> {
        let new_fd = Self::new_memfd()?;
        // Scratch view of the new section so we can populate it before
        // it's visible at the canonical address.
        let scratch = unsafe {
            libc::mmap(
                ptr::null_mut(),
                BLOCK_SIZE as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                new_fd,
                0,
            )
        };
        if scratch == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            unsafe { libc::close(new_fd) };
            return Err(e);
        }
        let canonical = block_base(block) as *mut libc::c_void;
        // Make sure the source is at least readable before the copy.
        unsafe {
            libc::mprotect(canonical, BLOCK_SIZE as usize, libc::PROT_READ | libc::PROT_EXEC);
            ptr::copy_nonoverlapping(canonical as *const u8, scratch as *mut u8, BLOCK_SIZE as usize);
            libc::munmap(scratch, BLOCK_SIZE as usize);
            libc::munmap(canonical, BLOCK_SIZE as usize);
        }
        if let Err(e) = Self::map_fixed(
            new_fd,
            block_base(block),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) {
            unsafe { libc::close(new_fd) };
            return Err(e);
        }
        self.counter(block).store(1, Ordering::SeqCst);
        let _ = src;
        Ok(Section { fd: new_fd, block })
    }

    fn owner_count(&self, sec: &Section) -> u32 {
        self.counter(sec.block).load(Ordering::SeqCst)
    }

    fn inc_owner(&mut self, sec: &Section) {
        self.counter(sec.block).fetch_add(1, Ordering::SeqCst);
    }

    fn dec_owner(&mut self, sec: &Section) -> u32 {
        self.counter(sec.block).fetch_sub(1, Ordering::SeqCst) - 1
    }
}
