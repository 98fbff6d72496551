//! Block pool + code cache ownership and the lazy-translation lookup
//! path: `find_next` is the one place that decides "translate it" vs.
//! "already have it", and the one place
//! that knows a `CacheFull` means "flush everything and retry", not an
//! error.

use std::io;

use dbt_core::{stats_enabled, BlockPool, DbtStats};
use dbt_emit::CodeBuffer;
use dbt_translate::{translate_block, DispatchTargets, GsSlots, GuestMemory};

use crate::stubs;

/// Default block-descriptor capacity; flushed and reused wholesale once
/// exhausted, same as the code cache itself.
const DEFAULT_BLOCK_CAPACITY: usize = 64 * 1024;

pub struct Engine {
    pool: BlockPool,
    buf: CodeBuffer,
    gs: GsSlots,
    stats: DbtStats,
}

impl Engine {
    pub fn new(cache_size: usize, gs: GsSlots) -> io::Result<Self> {
        let mut buf = CodeBuffer::new(cache_size)?;
        buf.set_executable()?;
        Ok(Self {
            pool: BlockPool::new(DEFAULT_BLOCK_CAPACITY),
            buf,
            gs,
            stats: DbtStats::default(),
        })
    }

    fn targets(&self) -> DispatchTargets {
        DispatchTargets {
            find_direct_internal: stubs::dbt_find_direct_internal as usize,
            find_indirect_internal: stubs::dbt_find_indirect_internal as usize,
            syscall_entry: stubs::dbt_syscall_entry as usize,
            tls_slot_to_offset_internal: stubs::dbt_tls_slot_to_offset_internal as usize,
        }
    }

    /// Full flush: every block, every trampoline, gone at
    /// once. No partial invalidation exists in this design.
    pub fn flush(&mut self) {
        self.pool.flush();
        self.buf.flush();
        self.stats.flush_count += 1;
    }

    /// Look up or translate the block starting at `pc`, returning its
    /// code-cache offset. Retries once, after a full flush, if the
    /// first attempt runs out of cache room.
    pub fn find_next(&mut self, mem: &dyn GuestMemory, pc: u32) -> usize {
        if let Some(b) = self.pool.find(pc) {
            self.stats.block_hit += 1;
            return b.cache_start;
        }
        self.stats.block_miss += 1;
        if let Some(start) = self.try_translate(mem, pc) {
            return start;
        }
        self.flush();
        self.try_translate(mem, pc)
            .expect("a single block cannot exceed the code cache capacity")
    }

    fn try_translate(&mut self, mem: &dyn GuestMemory, pc: u32) -> Option<usize> {
        let targets = self.targets();
        self.buf.set_writable().ok()?;
        let result = translate_block(&mut self.pool, &mut self.buf, mem, pc, targets, self.gs);
        self.buf.set_executable().ok()?;
        match result {
            Ok(idx) => Some(self.pool.get(idx).cache_start),
            Err(_cache_full) => None,
        }
    }

    /// Direct-chain dispatch: resolve `target_pc`, then
    /// patch the trampoline's relative displacement at `patch_addr` so
    /// every future hit of this call site skips straight to the block,
    /// bypassing both the trampoline and this dispatcher entirely.
    pub fn find_direct(&mut self, mem: &dyn GuestMemory, target_pc: u32, patch_addr: usize) -> usize {
        let target = self.find_next(mem, target_pc);
        let rel = target as i64 - (patch_addr as i64 + 4);
        // The cache is executable (never writable) while guest code is
        // running it, which is exactly when this gets called — flip to
        // writable for the single patched word, then back.
        self.buf.set_writable().expect("failed to make code cache writable for chain-patch");
        self.buf.patch_i32_le(patch_addr, rel as i32);
        self.buf.set_executable().expect("failed to restore code cache executable after chain-patch");
        self.stats.direct_chain_patched += 1;
        target
    }

    /// Indirect dispatch (RET / RETN imm16 / CALL_INDIRECT / JMP_INDIRECT):
    /// no chaining possible, just resolve and go.
    pub fn find_indirect(&mut self, mem: &dyn GuestMemory, target_pc: u32) -> usize {
        let target = self.find_next(mem, target_pc);
        self.stats.indirect_dispatch += 1;
        target
    }

    pub fn stats(&self) -> &DbtStats {
        &self.stats
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if stats_enabled() {
            eprint!("{}", self.stats);
        }
    }
}
