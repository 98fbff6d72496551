//! Code-cache bump allocator.
//!
//! The cache grows in two directions out of one backing buffer: `out`
//! bumps upward as the translator emits block code, while direct
//! trampoline stubs are bump-allocated downward from `end`. Both
//! cursors are owned here so that `dbt-translate` (which emits block
//! bodies) and `dbt-exec` (which emits trampoline stubs) share a single
//! source of truth for "is there room left", checking after *every*
//! allocation rather than only at block-alloc time so the two cursors
//! can never be made to collide.

use crate::block::BLOCK_MAXSIZE;

/// Exactly the size of a direct-trampoline stub:
/// `push imm32 patch_addr; push imm32 target_pc; jmp dbt_find_direct_internal`.
pub const TRAMPOLINE_SIZE: usize = 16;

/// Owns the raw bytes of the code cache and the two bump cursors.
/// Byte emission itself (ModR/M encoding, prefixes, etc.) lives in
/// `dbt-emit`; this type only hands out offset ranges and tracks the
/// high/low watermarks.
pub struct CodeCache {
    len: usize,
    out: usize,
    end: usize,
}

/// Returned when a request can't be satisfied against the remaining
/// capacity. The caller must flush the whole cache and retry; this is
/// not an error, just a retry trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFull;

impl CodeCache {
    pub fn new(len: usize) -> Self {
        Self { len, out: 0, end: len }
    }

    pub fn out(&self) -> usize {
        self.out
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Reset both cursors to an empty cache. Called as part of a full
    /// flush alongside `BlockPool::flush`.
    pub fn reset(&mut self) {
        self.out = 0;
        self.end = self.len;
    }

    /// Align `out` up to a 16-byte boundary, as required before
    /// translating a new block.
    pub fn align_out_16(&mut self) {
        self.out = (self.out + 15) & !15;
    }

    /// Reserve `n` bytes growing upward from `out`. Fails if fewer than
    /// `BLOCK_MAXSIZE` bytes would remain between the cursors afterward
    /// — the translator always budgets worst-case block size.
    pub fn reserve_out(&mut self, n: usize) -> Result<usize, CacheFull> {
        if self.out + n.max(BLOCK_MAXSIZE) > self.end {
            return Err(CacheFull);
        }
        let off = self.out;
        self.out += n;
        Ok(off)
    }

    /// Bump-allocate a trampoline stub downward from `end`. Checked
    /// after every call, not only at block-alloc time (resolved open
    /// question).
    pub fn alloc_trampoline(&mut self) -> Result<usize, CacheFull> {
        if self.end < TRAMPOLINE_SIZE {
            return Err(CacheFull);
        }
        let candidate = self.end - TRAMPOLINE_SIZE;
        if self.out + BLOCK_MAXSIZE > candidate {
            return Err(CacheFull);
        }
        self.end = candidate;
        Ok(candidate)
    }

    /// Bytes remaining between the two cursors.
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.out)
    }
}
