//! Guest-facing syscall entries: thin ABI wrappers
//! around `VmmState` that translate classic i386 `mmap`/`mmap2`/
//! `munmap`/`mprotect`/`brk` argument conventions and return negative
//! Linux errno values on failure, the shape `linux-user`'s INT 0x80
//! dispatcher expects to hand straight back to the guest in `eax`.

use std::sync::Arc;

use crate::map_list::FileBacking;
use crate::pager::HostPager;
use crate::state::{Errno, FileRequest, VmmState};

fn neg(e: Errno) -> i64 {
    -(e as i64)
}

/// `sys_mmap2` (syscall 192): `length` in bytes, `pgoffset` in units of
/// 4096 bytes regardless of host page size, per the i386 ABI.
#[allow(clippy::too_many_arguments)]
pub fn sys_mmap2<P: HostPager>(
    vmm: &mut VmmState<P>,
    addr: u64,
    length: u64,
    prot: u8,
    flags: u32,
    file: Option<(&Arc<dyn FileBacking>, u32)>,
) -> i64 {
    let req = file.map(|(f, pgoff)| FileRequest { file: f, offset_pages: pgoff });
    match vmm.mmap(addr, length, prot, flags, req) {
        Ok(a) => a as i64,
        Err(e) => neg(e),
    }
}

/// Old `sys_mmap` (syscall 90): the classic ABI passes a pointer to a
/// struct of args rather than registers directly; by the time this is
/// called `linux-user` has already unpacked it. `offset` here is in
/// bytes (not pages, unlike `mmap2`) and must be page-aligned.
#[allow(clippy::too_many_arguments)]
pub fn sys_oldmmap<P: HostPager>(
    vmm: &mut VmmState<P>,
    addr: u64,
    length: u64,
    prot: u8,
    flags: u32,
    file: Option<(&Arc<dyn FileBacking>, u64)>,
) -> i64 {
    if let Some((_, offset)) = &file {
        if offset % crate::PAGE_SIZE != 0 {
            return neg(libc::EINVAL);
        }
    }
    let req = file.map(|(f, offset)| FileRequest {
        file: f,
        offset_pages: (offset / crate::PAGE_SIZE) as u32,
    });
    match vmm.mmap(addr, length, prot, flags, req) {
        Ok(a) => a as i64,
        Err(e) => neg(e),
    }
}

pub fn sys_munmap<P: HostPager>(vmm: &mut VmmState<P>, addr: u64, length: u64) -> i64 {
    match vmm.munmap(addr, length) {
        Ok(()) => 0,
        Err(e) => neg(e),
    }
}

pub fn sys_mprotect<P: HostPager>(vmm: &mut VmmState<P>, addr: u64, length: u64, prot: u8) -> i64 {
    match vmm.mprotect(addr, length, prot) {
        Ok(()) => 0,
        Err(e) => neg(e),
    }
}

pub fn sys_brk<P: HostPager>(vmm: &mut VmmState<P>, addr: u64) -> i64 {
    vmm.sys_brk(addr) as i64
}

/// `msync`/`mlock`/`munlock` are accepted and no-ops: no host-backed
/// semantics to honor for a single-threaded anonymous/file-snapshot
/// address space, but guests that probe for these syscalls' presence
/// shouldn't see `ENOSYS`.
pub fn sys_msync(_addr: u64, _length: u64, _flags: i32) -> i64 {
    0
}

pub fn sys_mlock(_addr: u64, _length: u64) -> i64 {
    0
}

pub fn sys_munlock(_addr: u64, _length: u64) -> i64 {
    0
}
