//! Classic i386 `INT 0x80` syscall ABI: the translator core only calls
//! out to a `syscall_handler` entry point, and this module is that
//! handler. `eax` carries the syscall number; `ebx,ecx,edx,esi,edi,ebp`
//! carry up to six arguments, the same register convention every i386
//! Linux syscall stub uses.
//!
//! Guest file descriptors are host file descriptors directly: this
//! loader runs the guest as one native process sharing one fd table,
//! so there's no descriptor-virtualization layer to build here — just
//! the minimum a static binary's libc needs to get off the ground.

use std::ffi::CString;
use std::io;
use std::mem;
use std::sync::Arc;

use dbt_exec::{GuestRegs, SyscallHandler, SyscallOutcome};
use vmm::{
    sys_mlock, sys_mmap2, sys_mprotect, sys_msync, sys_munlock, sys_munmap, sys_oldmmap, sys_brk,
    FileBacking, LinuxPager, VmmState,
};

use crate::process;

const SYS_EXIT: u32 = 1;
const SYS_FORK: u32 = 2;
const SYS_READ: u32 = 3;
const SYS_WRITE: u32 = 4;
const SYS_OPEN: u32 = 5;
const SYS_CLOSE: u32 = 6;
const SYS_UNLINK: u32 = 10;
const SYS_LSEEK: u32 = 19;
const SYS_GETPID: u32 = 20;
const SYS_BRK: u32 = 45;
const SYS_IOCTL: u32 = 54;
const SYS_READLINK: u32 = 85;
const SYS_MMAP: u32 = 90;
const SYS_MUNMAP: u32 = 91;
const SYS_FSTAT: u32 = 108;
const SYS_UNAME: u32 = 122;
const SYS_MPROTECT: u32 = 125;
const SYS_WRITEV: u32 = 146;
const SYS_RT_SIGACTION: u32 = 174;
const SYS_RT_SIGPROCMASK: u32 = 175;
const SYS_MMAP2: u32 = 192;
const SYS_STAT64: u32 = 195;
const SYS_FSTAT64: u32 = 197;
const SYS_GETUID32: u32 = 199;
const SYS_GETGID32: u32 = 200;
const SYS_GETEUID32: u32 = 201;
const SYS_GETEGID32: u32 = 202;
const SYS_MSYNC: u32 = 144;
const SYS_MLOCK: u32 = 150;
const SYS_MUNLOCK: u32 = 151;
const SYS_GETTID: u32 = 224;
const SYS_FUTEX: u32 = 240;
const SYS_SET_THREAD_AREA: u32 = 243;
const SYS_EXIT_GROUP: u32 = 252;
const SYS_SET_TID_ADDRESS: u32 = 258;

const MAX_PATH: usize = 4096;

/// Wraps a host `fd` opened by a guest `open()` so file-backed `mmap2`
/// can read it through the same `FileBacking` seam `vmm` uses for every
/// other file-backed mapping.
struct HostFile(i32);

impl FileBacking for HostFile {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let n = unsafe {
            libc::pread(
                self.0,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Reads a NUL-terminated guest string, capped at `MAX_PATH` bytes.
///
/// # Safety
/// `addr` must point at memory `vmm` has mapped readable.
unsafe fn read_cstr(addr: u32) -> Vec<u8> {
    let mut v = Vec::new();
    let mut p = addr as usize as *const u8;
    for _ in 0..MAX_PATH {
        let b = *p;
        if b == 0 {
            break;
        }
        v.push(b);
        p = p.add(1);
    }
    v
}

fn neg(errno: i32) -> i64 {
    -(errno as i64)
}

/// `struct mmap_arg_struct` the old `mmap` (syscall 90) ABI passes a
/// pointer to, instead of spreading its six fields across registers.
#[repr(C)]
struct OldMmapArgs {
    addr: u32,
    len: u32,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u32,
}

/// Guest-visible `struct user_desc`, same layout as `tls::UserDesc` on
/// the host side of `SYS_SET_THREAD_AREA`.
#[repr(C)]
struct GuestUserDesc {
    entry_number: u32,
    base_addr: u32,
    limit: u32,
    flags: u32,
}

/// Owns the VMM and drives the syscalls a static i386 binary's libc
/// startup path and a `write`-based "hello world" actually issue.
pub struct LinuxProcess {
    pub vm: VmmState<LinuxPager>,
    pub elf_path: String,
}

impl LinuxProcess {
    pub fn new(vm: VmmState<LinuxPager>, elf_path: String) -> Self {
        Self { vm, elf_path }
    }

    fn do_mmap2(&mut self, addr: u32, len: u32, prot: u32, flags: u32, fd: i32, pgoff: u32) -> i64 {
        let prot8 = (prot & 0x7) as u8;
        if fd >= 0 {
            let file: Arc<dyn FileBacking> = Arc::new(HostFile(fd));
            sys_mmap2(&mut self.vm, addr as u64, len as u64, prot8, flags, Some((&file, pgoff)))
        } else {
            sys_mmap2(&mut self.vm, addr as u64, len as u64, prot8, flags, None)
        }
    }

    fn do_oldmmap(&mut self, args_addr: u32) -> i64 {
        let args = unsafe { (args_addr as usize as *const OldMmapArgs).read_unaligned() };
        let prot8 = (args.prot & 0x7) as u8;
        if args.fd >= 0 {
            let file: Arc<dyn FileBacking> = Arc::new(HostFile(args.fd));
            sys_oldmmap(
                &mut self.vm,
                args.addr as u64,
                args.len as u64,
                prot8,
                args.flags,
                Some((&file, args.offset as u64)),
            )
        } else {
            sys_oldmmap(&mut self.vm, args.addr as u64, args.len as u64, prot8, args.flags, None)
        }
    }

    fn do_open(&mut self, path_addr: u32, flags: i32, mode: u32) -> i64 {
        let bytes = unsafe { read_cstr(path_addr) };
        let path = match CString::new(bytes) {
            Ok(p) => p,
            Err(_) => return neg(libc::EINVAL),
        };
        let fd = unsafe { libc::open(path.as_ptr(), flags, mode) };
        if fd < 0 {
            neg(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            fd as i64
        }
    }

    fn do_uname(&mut self, buf_addr: u32) -> i64 {
        // struct utsname: six 65-byte NUL-padded fields (i386/Linux ABI).
        let fields: [&str; 6] = ["Linux", "dbt-ia32", "6.1.0", "#1", "i686", "(none)"];
        let mut off = buf_addr;
        for f in fields {
            let bytes = f.as_bytes();
            let mut field = [0u8; 65];
            field[..bytes.len()].copy_from_slice(bytes);
            unsafe { process::write_bytes(off, &field) };
            off += 65;
        }
        0
    }

    /// `entry_number == -1` means "allocate any free entry"; the kernel
    /// (and `tls::tls_alloc`) writes the chosen entry number back into
    /// the guest's `user_desc` before returning.
    fn do_set_thread_area(&mut self, desc_addr: u32) -> i64 {
        let mut desc = unsafe { (desc_addr as usize as *const GuestUserDesc).read_unaligned() };
        let requested = if desc.entry_number == u32::MAX {
            None
        } else {
            Some(desc.entry_number)
        };
        match crate::tls::tls_alloc(requested, desc.base_addr) {
            Ok(entry) => {
                desc.entry_number = entry;
                let bytes = unsafe {
                    std::slice::from_raw_parts(&desc as *const GuestUserDesc as *const u8, mem::size_of::<GuestUserDesc>())
                };
                unsafe { process::write_bytes(desc_addr, bytes) };
                0
            }
            Err(_) => neg(libc::EINVAL),
        }
    }

    fn do_readlink(&mut self, path_addr: u32, buf_addr: u32, bufsize: u32) -> i64 {
        let bytes = unsafe { read_cstr(path_addr) };
        if bytes == b"/proc/self/exe" {
            let n = self.elf_path.len().min(bufsize as usize);
            let path = self.elf_path.clone();
            unsafe { process::write_bytes(buf_addr, &path.as_bytes()[..n]) };
            n as i64
        } else {
            neg(libc::ENOENT)
        }
    }
}

impl SyscallHandler for LinuxProcess {
    fn syscall(&mut self, regs: &mut GuestRegs) -> SyscallOutcome {
        let nr = regs.eax;
        let (a0, a1, a2, a3, a4) = (regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi);

        if nr == SYS_EXIT || nr == SYS_EXIT_GROUP {
            return SyscallOutcome::Exit(a0 as i32);
        }

        let ret: i64 = match nr {
            SYS_READ => {
                let n = unsafe { libc::read(a0 as i32, a1 as usize as *mut libc::c_void, a2 as usize) };
                if n < 0 {
                    neg(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
                } else {
                    n as i64
                }
            }
            SYS_WRITE => {
                let n = unsafe { libc::write(a0 as i32, a1 as usize as *const libc::c_void, a2 as usize) };
                if n < 0 {
                    neg(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
                } else {
                    n as i64
                }
            }
            SYS_OPEN => self.do_open(a0, a1 as i32, a2),
            SYS_CLOSE => {
                if unsafe { libc::close(a0 as i32) } == 0 {
                    0
                } else {
                    neg(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
                }
            }
            SYS_UNLINK => {
                let bytes = unsafe { read_cstr(a0) };
                let path = CString::new(bytes).unwrap_or_default();
                if unsafe { libc::unlink(path.as_ptr()) } == 0 {
                    0
                } else {
                    neg(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
                }
            }
            SYS_LSEEK => {
                let off = unsafe { libc::lseek(a0 as i32, a1 as i32 as libc::off_t, a2 as i32) };
                if off < 0 {
                    neg(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
                } else {
                    off as i64
                }
            }
            SYS_GETPID => unsafe { libc::getpid() as i64 },
            SYS_GETTID => unsafe { libc::syscall(libc::SYS_gettid) },
            SYS_BRK => sys_brk(&mut self.vm, a0 as u64),
            SYS_IOCTL => neg(libc::ENOTTY),
            SYS_READLINK => self.do_readlink(a0, a1, a2),
            SYS_MMAP => self.do_oldmmap(a0),
            SYS_MUNMAP => sys_munmap(&mut self.vm, a0 as u64, a1 as u64),
            SYS_FSTAT | SYS_FSTAT64 | SYS_STAT64 => neg(libc::ENOSYS),
            SYS_UNAME => self.do_uname(a0),
            SYS_MPROTECT => sys_mprotect(&mut self.vm, a0 as u64, a1 as u64, (a2 & 0x7) as u8),
            SYS_WRITEV => {
                let n = unsafe { libc::writev(a0 as i32, a1 as usize as *const libc::iovec, a2 as i32) };
                if n < 0 {
                    neg(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
                } else {
                    n as i64
                }
            }
            SYS_RT_SIGACTION | SYS_RT_SIGPROCMASK => 0,
            SYS_MMAP2 => self.do_mmap2(a0, a1, a2, a3, a4 as i32, regs.ebp),
            SYS_GETUID32 | SYS_GETGID32 | SYS_GETEUID32 | SYS_GETEGID32 => 0,
            SYS_MSYNC => sys_msync(a0 as u64, a1 as u64, a2 as i32),
            SYS_MLOCK => sys_mlock(a0 as u64, a1 as u64),
            SYS_MUNLOCK => sys_munlock(a0 as u64, a1 as u64),
            SYS_SET_THREAD_AREA => self.do_set_thread_area(a0),
            SYS_SET_TID_ADDRESS => unsafe { libc::getpid() as i64 },
            SYS_FUTEX => 0,
            SYS_FORK => neg(libc::ENOSYS),
            _ => neg(libc::ENOSYS),
        };

        regs.eax = ret as u32;
        SyscallOutcome::Continue
    }
}
