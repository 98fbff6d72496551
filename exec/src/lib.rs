//! Dispatcher/runtime: owns the code cache and block pool, drives the
//! trampoline-chaining dispatch loop, and
//! crosses into/out of the code cache via a pair of hand-written
//! assembly stubs in [`stubs`] rather than any `extern "C"`-callable
//! closure, since the whole point of direct chaining is that most
//! block-to-block transfers never come back to Rust at all.

mod engine;
mod regs;
mod stubs;

pub use dbt_translate::{GsSlots, GuestMemory};
pub use engine::Engine;
pub use regs::{GuestRegs, SyscallOutcome};

use std::io;

/// Implemented by `linux-user`: turns a decoded `INT 0x80` register
/// state into a Linux syscall, writing the result back into `regs.eax`
/// (or any other registers a particular syscall number defines as
/// clobbered) and deciding whether the block should continue.
pub trait SyscallHandler {
    fn syscall(&mut self, regs: &mut GuestRegs) -> SyscallOutcome;
}

/// Build a fresh engine: empty block pool, empty (executable) code
/// cache of `cache_size` bytes.
pub fn dbt_init(cache_size: usize, gs: GsSlots) -> io::Result<Engine> {
    Engine::new(cache_size, gs)
}

/// Full flush: drop every translated block and trampoline.
pub fn dbt_reset(engine: &mut Engine) {
    engine.flush();
}

/// Nothing beyond normal `Drop` is required; kept as a named entry
/// point to mirror `dbt_init` and to give `linux-user` a place to hang
/// an explicit shutdown log line if it wants one.
pub fn dbt_shutdown(engine: Engine) {
    drop(engine);
}

/// Enter the code cache at `pc` with the given initial register state
/// (only `esp`/`sp` matters on entry; the rest of `GuestRegs` comes
/// from wherever the ELF loader set up the initial process image) and
/// run until the guest asks to exit (`sys_exit`/`sys_exit_group`
/// routed through `handler`). Returns the exit code.
///
/// `mem`/`handler` are borrowed only for the duration of this call;
/// the dispatch stubs reach them back through a thread-local slot that
/// is cleared before this function returns, so there is no way for a
/// dangling reference to outlive it.
pub fn dbt_run(
    engine: &mut Engine,
    mem: &dyn GuestMemory,
    handler: &mut dyn SyscallHandler,
    pc: u32,
    sp: u32,
) -> i32 {
    let target = engine.find_next(mem, pc) as u32;
    let regs = GuestRegs {
        esp: sp,
        ..Default::default()
    };

    stubs::enter_runtime(
        engine as *mut Engine,
        mem as *const dyn GuestMemory,
        handler as *mut dyn SyscallHandler,
    );
    // SAFETY: `target` came from this same engine's code cache and is
    // executable; `regs` is a valid, fully-initialized snapshot.
    let exit_code = unsafe { stubs::dbt_enter(target, &regs) };
    stubs::leave_runtime();
    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatMemory {
        bytes: Vec<u8>,
        base: u32,
    }

    impl GuestMemory for FlatMemory {
        fn bytes_at(&self, pc: u32) -> &[u8] {
            let off = (pc - self.base) as usize;
            &self.bytes[off..]
        }
    }

    struct NoopHandler;
    impl SyscallHandler for NoopHandler {
        fn syscall(&mut self, regs: &mut GuestRegs) -> SyscallOutcome {
            regs.eax = 0;
            SyscallOutcome::Continue
        }
    }

    fn gs() -> GsSlots {
        GsSlots {
            scratch_offset: 0,
            gs_offset: 4,
            gs_addr_offset: 8,
        }
    }

    #[test]
    fn init_reset_shutdown_roundtrip() {
        let mut engine = dbt_init(64 * 1024, gs()).unwrap();
        dbt_reset(&mut engine);
        dbt_shutdown(engine);
    }

    #[test]
    fn find_next_translates_then_hits_cache() {
        let mut engine = dbt_init(64 * 1024, gs()).unwrap();
        // RET (0xC3) is a one-byte terminator; a trivial smallest block.
        let mem = FlatMemory { bytes: vec![0xC3], base: 0x1000 };
        let a = engine.find_next(&mem, 0x1000);
        let b = engine.find_next(&mem, 0x1000);
        assert_eq!(a, b);
        assert_eq!(engine.stats().block_hit, 1);
        assert_eq!(engine.stats().block_miss, 1);
    }
}
