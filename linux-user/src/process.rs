//! Guest memory access.
//!
//! Guest and host addresses are identical on this target: the guest
//! is 32-bit x86 running on a 32-bit x86 host, so there is no g2h/h2g
//! translation layer here the way a
//! cross-ISA `linux-user` needs — `vmm::VmmState::mmap` already places
//! every mapping at its literal guest address via `MAP_FIXED`. This
//! module just supplies the `dbt_translate::GuestMemory` instruction
//! fetch the translator needs and the raw read/write helpers the ELF
//! loader and syscall layer use to touch guest-mapped bytes directly.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicPtr, Ordering};

use dbt_translate::GuestMemory;

use vmm::{GUEST_ADDR_LIMIT, LinuxPager, VmmState};

/// Largest x86 instruction is 15 bytes; round up generously so the
/// translator never has to re-fetch mid-instruction, but stay well
/// short of risking a read past an unmapped page the guest address
/// happens to sit near the end of.
const FETCH_WINDOW: u32 = 64;

/// Zero-sized `GuestMemory` impl: every guest address this process
/// cares about is, by construction, a real host address once `vmm` has
/// mapped it. Reading an address `vmm` hasn't mapped is exactly as
/// fatal here as it would be for the guest itself (SIGSEGV into the
/// fault handler), which is the correct behavior for a decode attempt
/// against unmapped guest code.
pub struct ProcessMemory;

impl GuestMemory for ProcessMemory {
    fn bytes_at(&self, pc: u32) -> &[u8] {
        let remaining = (GUEST_ADDR_LIMIT as u32).saturating_sub(pc);
        let len = FETCH_WINDOW.min(remaining.max(1)) as usize;
        // SAFETY: caller (the translator) only decodes a handful of
        // bytes from the start of this slice; `pc` is only ever handed
        // here once `vmm` has mapped it executable.
        unsafe { std::slice::from_raw_parts(pc as usize as *const u8, len) }
    }
}

/// # Safety
/// `addr..addr+data.len()` must already be mapped writable.
pub unsafe fn write_bytes(addr: u32, data: &[u8]) {
    std::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len());
}

/// # Safety
/// `addr..addr+4` must already be mapped writable.
pub unsafe fn write_u32(addr: u32, val: u32) {
    (addr as usize as *mut u32).write_unaligned(val);
}

/// # Safety
/// `addr..addr+4` must already be mapped readable.
pub unsafe fn read_u32(addr: u32) -> u32 {
    (addr as usize as *const u32).read_unaligned()
}

/// The `VmmState` the SIGSEGV handler below drives `handle_page_fault`
/// on. Raw pointer, not a borrow, for the same reason `dbt-exec`'s
/// `RUNTIME` slot is one: a signal handler can only be a plain
/// `extern "C" fn`.
static VMM_STATE: AtomicPtr<VmmState<LinuxPager>> = AtomicPtr::new(std::ptr::null_mut());

/// Registers the address space `sigsegv_handler` resolves COW faults
/// against. Must be called before `install_sigsegv_handler`, and the
/// pointee must outlive every guest fault that can occur afterward.
pub fn set_active_vmm(vm: *mut VmmState<LinuxPager>) {
    VMM_STATE.store(vm, Ordering::Relaxed);
}

/// Extracts the faulting address from `siginfo_t` and routes it through
/// `VmmState::handle_page_fault`. A write to an already-writable page
/// or to one `vmm` never mapped isn't a COW fault at all; restoring the
/// default disposition and returning lets the faulting instruction
/// re-execute and this time actually kill the process, same as if no
/// handler were installed.
extern "C" fn sigsegv_handler(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: the kernel hands a valid siginfo_t to a SA_SIGINFO handler.
    let addr = unsafe { (*info).si_addr() } as u64;
    let vm = VMM_STATE.load(Ordering::Relaxed);
    // SAFETY: `vm` was registered by `set_active_vmm` and outlives the
    // guest run that could still be faulting.
    let handled = !vm.is_null() && unsafe { (*vm).handle_page_fault(addr) };
    if !handled {
        unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        }
    }
}

/// Installs `sigsegv_handler` as the real `SIGSEGV` disposition. Must
/// run once, before any guest code that could write a `fork`-protected
/// COW page, and after `set_active_vmm`.
pub fn install_sigsegv_handler() -> io::Result<()> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = sigsegv_handler as usize;
    sa.sa_flags = libc::SA_SIGINFO;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    let ret = unsafe { libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
