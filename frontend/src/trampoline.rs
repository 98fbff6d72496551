//! Direct trampolines and chaining.
//!
//! Emitting a trampoline stub is the one piece of "dispatch" logic that
//! has to live alongside the translator itself: a `CALL_DIRECT`/
//! `JMP_DIRECT`/`JCC` terminator needs a trampoline address *during*
//! translation, before the block it belongs to has finished emitting.
//! The dispatcher addresses that the stub ultimately jumps to
//! (`dbt_find_direct_internal`) are owned by `dbt-exec`, which calls
//! into this module rather than the other way around — `dbt-translate`
//! never depends on `dbt-exec`.

use dbt_core::BlockPool;
use dbt_emit::CodeBuffer;

/// `get_direct_trampoline(target_pc, patch_addr)`: if `target_pc` is
/// already translated, return its `cache_start` directly. Otherwise
/// bump-allocate a 16-byte stub from the tail of the cache:
/// `push imm32 patch_addr; push imm32 target_pc; jmp find_direct_internal`.
pub fn get_direct_trampoline(
    pool: &BlockPool,
    buf: &mut CodeBuffer,
    target_pc: u32,
    patch_addr: usize,
    find_direct_internal: usize,
) -> Result<usize, dbt_core::CacheFull> {
    if let Some(block) = pool.find(target_pc) {
        return Ok(block.cache_start);
    }

    let stub_off = buf.alloc_trampoline()?;
    let mut off = stub_off;
    dbt_emit::emit::emit_push_imm32(buf, &mut off, patch_addr as u32);
    dbt_emit::emit::emit_push_imm32(buf, &mut off, target_pc);
    dbt_emit::emit::emit_jmp_rel32(buf, &mut off, find_direct_internal);
    debug_assert_eq!(off - stub_off, dbt_core::TRAMPOLINE_SIZE);
    Ok(stub_off)
}
