//! Per-instruction translator: decodes a guest basic block
//! instruction by instruction and emits equivalent host code, ending
//! the block at the first control-transfer instruction.

use dbt_core::{BlockPool, CacheFull};
use dbt_decode::{decode, InsnKind};
use dbt_emit::emit;
use dbt_emit::CodeBuffer;

use crate::error::{fatal_opcode, fatal_prefix};
use crate::trampoline::get_direct_trampoline;

/// Guest code access. The translator only ever reads; real guest
/// memory is provided by `linux-user`'s address-space reservation, and
/// tests can back this with a plain byte buffer.
pub trait GuestMemory {
    /// Bytes starting at guest address `pc`, at least long enough to
    /// decode the next instruction (the caller is expected to hand
    /// back a slice that runs to the end of the mapped page or
    /// further).
    fn bytes_at(&self, pc: u32) -> &[u8];
}

/// Addresses of the assembly dispatcher entry points,
/// owned and supplied by `dbt-exec`.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTargets {
    pub find_direct_internal: usize,
    pub find_indirect_internal: usize,
    /// Entry point `INT 0x80` calls out to. `INT 0x80` continues the
    /// block rather than ending it: the syscall itself is handled out
    /// of line by `dbt-exec`'s syscall trampoline, which returns here.
    pub syscall_entry: usize,
    /// Entry point `MOV_TO_SEG` calls out to once it has shifted the
    /// new selector right 3 to get its allocated TLS entry number:
    /// takes the entry number in `eax`, returns that entry's
    /// fs-relative byte offset in `eax`. Implemented by `tls_alloc`'s
    /// counterpart, `tls_slot_to_offset`.
    pub tls_slot_to_offset_internal: usize,
}

/// Per-thread TLS slot offsets for the emulated GS segment
/// (MOV_FROM_SEG/MOV_TO_SEG), all reachable via the real `fs` segment
/// the host thread-control-block already occupies: a scratch spill
/// slot, the raw selector last loaded into GS, and the thread-base
/// address that selector resolves to (looked up through
/// `tls_slot_to_offset` whenever `MOV_TO_SEG` loads a new selector).
#[derive(Debug, Clone, Copy)]
pub struct GsSlots {
    pub scratch_offset: i32,
    pub gs_offset: i32,
    pub gs_addr_offset: i32,
}

/// Maximum guest instructions translated per block before forcing a
/// terminator; guards against runaway NORMAL sequences with no
/// control transfer (shouldn't happen with well-formed guest code, but
/// keeps the bump allocator's BLOCK_MAXSIZE budget honest).
const MAX_INSNS_PER_BLOCK: usize = 256;

/// Translate one basic block starting at `guest_pc`, emit it into
/// `buf`, allocate its descriptor in `pool`, and return the new block's
/// index. Returns `Err(CacheFull)` if there isn't room; the caller
/// must flush (`BlockPool::flush` + `CodeBuffer::flush`) and retry —
/// this is not an error, just a retry trigger.
pub fn translate_block(
    pool: &mut BlockPool,
    buf: &mut CodeBuffer,
    mem: &impl GuestMemory,
    guest_pc: u32,
    targets: DispatchTargets,
    gs: GsSlots,
) -> Result<u32, CacheFull> {
    buf.align_out_16();
    let cache_start = buf.reserve(0)?;
    let idx = pool.alloc(guest_pc, cache_start).ok_or(CacheFull)?;

    let mut pc = guest_pc;
    for _ in 0..MAX_INSNS_PER_BLOCK {
        let code = mem.bytes_at(pc);
        let d = match decode(code) {
            Ok(d) => d,
            Err(dbt_decode::DecodeError::FatalPrefix(b)) => fatal_prefix(pc, b),
        };
        let next_pc = pc.wrapping_add(d.len as u32);

        match d.kind {
            InsnKind::Normal => {
                let mut off = buf.reserve(d.len)?;
                emit_normal(buf, &mut off, code, &d);
            }
            InsnKind::CallDirect => {
                let target = read_rel(pc, &d);
                // push imm32 return_pc (5 bytes); jmp rel32 trampoline (5 bytes).
                let mut off = buf.reserve(10)?;
                let patch_addr = off + 5 + 1;
                let trampoline = get_direct_trampoline(pool, buf, target, patch_addr, targets.find_direct_internal)?;
                emit::emit_push_imm32(buf, &mut off, next_pc);
                emit::emit_jmp_rel32(buf, &mut off, trampoline);
                break;
            }
            InsnKind::CallIndirect => {
                let mut off = buf.reserve(20)?;
                emit::emit_push_imm32(buf, &mut off, next_pc);
                let mut rm = d.modrm.unwrap().rm;
                if rm.base == Some(4) {
                    rm.disp += 4;
                }
                let modrm_bytes = emit::encode_rm(6, &rm);
                emit::emit_push_mem(buf, &mut off, &modrm_bytes);
                emit::emit_jmp_rel32(buf, &mut off, targets.find_indirect_internal);
                break;
            }
            InsnKind::Ret => {
                let mut off = buf.reserve(5)?;
                emit::emit_jmp_rel32(buf, &mut off, targets.find_indirect_internal);
                break;
            }
            InsnKind::RetnImm16 => {
                let n = u16::from_le_bytes([d.imm[0], d.imm[1]]) as i32;
                let mut off = buf.reserve(20)?;
                let pop_disp = n - 4;
                let pop_rm = dbt_decode::Rm { register: None, base: Some(4), index: None, disp: pop_disp };
                let pop_bytes = emit::encode_rm(0, &pop_rm);
                emit::emit_pop_mem(buf, &mut off, &pop_bytes);
                emit::emit_lea_esp_disp32(buf, &mut off, pop_disp);
                emit::emit_jmp_rel32(buf, &mut off, targets.find_indirect_internal);
                break;
            }
            InsnKind::JmpDirect => {
                let target = read_rel(pc, &d);
                // jmp rel32 (5 bytes); the displacement field is at off+1.
                let mut off = buf.reserve(5)?;
                let patch_addr = off + 1;
                let trampoline = get_direct_trampoline(pool, buf, target, patch_addr, targets.find_direct_internal)?;
                emit::emit_jmp_rel32(buf, &mut off, trampoline);
                break;
            }
            InsnKind::JmpIndirect => {
                let mut off = buf.reserve(10)?;
                let modrm_bytes = emit::encode_rm(6, &d.modrm.unwrap().rm);
                emit::emit_push_mem(buf, &mut off, &modrm_bytes);
                emit::emit_jmp_rel32(buf, &mut off, targets.find_indirect_internal);
                break;
            }
            InsnKind::Jcc { cc } => {
                let taken = read_rel(pc, &d);
                // jcc rel32 (6 bytes, disp at off+2); jmp rel32 fallthrough (5 bytes, disp at off+7).
                let mut off = buf.reserve(11)?;
                let taken_patch_addr = off + 2;
                let taken_tramp = get_direct_trampoline(pool, buf, taken, taken_patch_addr, targets.find_direct_internal)?;
                emit::emit_jcc_rel32(buf, &mut off, cc, taken_tramp);
                let ft_patch_addr = off + 1;
                let ft_tramp = get_direct_trampoline(pool, buf, next_pc, ft_patch_addr, targets.find_direct_internal)?;
                emit::emit_jmp_rel32(buf, &mut off, ft_tramp);
                break;
            }
            InsnKind::JccRel8 => {
                // op $+2; jmp $+5; jmp taken-trampoline; jmp fallthrough-trampoline
                let disp8 = d.imm[0] as i8 as i32;
                let taken = next_pc.wrapping_add(disp8 as u32);
                let mut off = buf.reserve(14)?;
                let block_start = off;
                let taken_patch_addr = block_start + 4 + 1;
                let ft_patch_addr = block_start + 9 + 1;
                let taken_tramp = get_direct_trampoline(pool, buf, taken, taken_patch_addr, targets.find_direct_internal)?;
                let ft_tramp = get_direct_trampoline(pool, buf, next_pc, ft_patch_addr, targets.find_direct_internal)?;
                buf.push_u8(&mut off, code[0]);
                buf.push_u8(&mut off, 2); // op rel8 = $+2 -> lands on "jmp taken-trampoline"
                buf.push_u8(&mut off, 0xEB);
                buf.push_u8(&mut off, 5); // jmp $+5 -> skip the taken jmp, land on fallthrough jmp
                emit::emit_jmp_rel32(buf, &mut off, taken_tramp);
                emit::emit_jmp_rel32(buf, &mut off, ft_tramp);
                debug_assert_eq!(off - block_start, 14);
                break;
            }
            InsnKind::Int => {
                if d.imm[0] != 0x80 {
                    fatal_opcode(pc, d.opcode, d.kind);
                }
                let mut off = buf.reserve(5)?;
                emit::emit_call_rel32(buf, &mut off, targets.syscall_entry);
                // continues the block
            }
            InsnKind::MovFromSeg => {
                emit_mov_from_gs(buf, &d, gs)?;
            }
            InsnKind::MovToSeg => {
                emit_mov_to_gs(buf, &d, gs, targets.tls_slot_to_offset_internal)?;
            }
            InsnKind::Unknown | InsnKind::Invalid | InsnKind::Privileged | InsnKind::Unsupported => {
                fatal_opcode(pc, d.opcode, d.kind);
            }
        }

        pc = next_pc;
    }

    Ok(idx)
}

fn read_rel(pc: u32, d: &dbt_decode::Decoded) -> u32 {
    let next_ip = pc.wrapping_add(d.len as u32);
    let rel = if d.imm.len() == 1 {
        d.imm[0] as i8 as i32
    } else {
        i32::from_le_bytes(d.imm.try_into().unwrap())
    };
    next_ip.wrapping_add(rel as u32)
}

/// `MOV_FROM_SEG` (GS only): spill a scratch register, read the
/// emulated GS selector, store it to the guest operand, restore the
/// scratch register. A real `mov reg, gs` hands back the selector
/// itself, not the thread-base address it resolves to, so this reads
/// `gs_offset`, not `gs_addr_offset`.
fn emit_mov_from_gs(buf: &mut CodeBuffer, d: &dbt_decode::Decoded, gs: GsSlots) -> Result<(), CacheFull> {
    let rm = d.modrm.unwrap().rm;
    let occupied = occupied_mask(&rm);
    let t = dbt_core::pick_scratch(occupied).expect("no free scratch register for MOV_FROM_SEG");
    let mut off = buf.reserve(40)?;
    emit_fs_mov_store(buf, &mut off, t.encoding(), gs.scratch_offset);
    emit_fs_mov_load(buf, &mut off, t.encoding(), gs.gs_offset);
    let dst = emit::encode_rm(t.encoding(), &rm);
    buf.push_u8(&mut off, 0x89); // mov r/m32, r32
    buf.push_bytes(&mut off, &dst);
    emit_fs_mov_load(buf, &mut off, t.encoding(), gs.scratch_offset);
    Ok(())
}

/// `MOV_TO_SEG` (GS only): spill, load the new selector into the
/// scratch register and store it to `gs_offset`, then actually resolve
/// it the way a real segment load would. The selector's low 3 bits are
/// the RPL/TI fields `shr 3` discards, leaving the TLS entry number the
/// guest's `set_thread_area` call allocated; a mini-prologue that keeps
/// EAX/ECX/EDX intact around the call carries that entry number into
/// `tls_slot_to_offset` (in EAX) and gets back the fs-relative offset
/// of the entry's resolved thread-base address (also in EAX), which is
/// then read and stored into `gs_addr_offset`.
fn emit_mov_to_gs(
    buf: &mut CodeBuffer,
    d: &dbt_decode::Decoded,
    gs: GsSlots,
    tls_slot_to_offset_internal: usize,
) -> Result<(), CacheFull> {
    let rm = d.modrm.unwrap().rm;
    let occupied = occupied_mask(&rm);
    let t = dbt_core::pick_scratch(occupied).expect("no free scratch register for MOV_TO_SEG");
    let mut off = buf.reserve(72)?;

    emit_fs_mov_store(buf, &mut off, t.encoding(), gs.scratch_offset);
    let src = emit::encode_rm(t.encoding(), &rm);
    buf.push_u8(&mut off, 0x8B); // mov r32, r/m32 -> T = new selector
    buf.push_bytes(&mut off, &src);
    emit_fs_mov_store(buf, &mut off, t.encoding(), gs.gs_offset);

    buf.push_u8(&mut off, 0x9C); // pushfd
    emit::emit_shr_imm8(buf, &mut off, t.encoding(), 3); // T = TLS entry number
    emit::emit_push_reg(buf, &mut off, dbt_core::Gpr::Eax.encoding());
    emit::emit_push_reg(buf, &mut off, dbt_core::Gpr::Ecx.encoding());
    emit::emit_push_reg(buf, &mut off, dbt_core::Gpr::Edx.encoding());
    emit::emit_mov_reg_reg(buf, &mut off, dbt_core::Gpr::Eax.encoding(), t.encoding());
    emit::emit_call_rel32(buf, &mut off, tls_slot_to_offset_internal);
    emit_fs_mov_load_indirect(buf, &mut off, t.encoding(), dbt_core::Gpr::Eax.encoding());
    // T now holds the resolved thread base; store it before popping
    // EAX/ECX/EDX, since T may be one of those three registers.
    emit_fs_mov_store(buf, &mut off, t.encoding(), gs.gs_addr_offset);
    emit::emit_pop_reg(buf, &mut off, dbt_core::Gpr::Edx.encoding());
    emit::emit_pop_reg(buf, &mut off, dbt_core::Gpr::Ecx.encoding());
    emit::emit_pop_reg(buf, &mut off, dbt_core::Gpr::Eax.encoding());
    buf.push_u8(&mut off, 0x9D); // popfd

    emit_fs_mov_load(buf, &mut off, t.encoding(), gs.scratch_offset);
    Ok(())
}

fn occupied_mask(rm: &dbt_decode::Rm) -> dbt_core::RegMask {
    let mut mask = dbt_core::RegMask::default();
    if let Some(r) = rm.register {
        mask = mask.with(r);
    }
    if let Some(b) = rm.base {
        mask = mask.with(b);
    }
    if let Some((idx, _)) = rm.index {
        mask = mask.with(idx);
    }
    mask
}

fn emit_fs_mov_store(buf: &mut CodeBuffer, off: &mut usize, reg: u8, disp: i32) {
    buf.push_u8(off, 0x64); // fs segment override
    buf.push_u8(off, 0x89); // mov r/m32, r32
    buf.push_u8(off, emit::modrm_byte(emit::MOD_INDIRECT, reg, 5)); // disp32, no base
    buf.push_i32_le(off, disp);
}

fn emit_fs_mov_load(buf: &mut CodeBuffer, off: &mut usize, reg: u8, disp: i32) {
    buf.push_u8(off, 0x64);
    buf.push_u8(off, 0x8B); // mov r32, r/m32
    buf.push_u8(off, emit::modrm_byte(emit::MOD_INDIRECT, reg, 5)); // disp32, no base
    buf.push_i32_le(off, disp);
}

/// `mov reg, fs:[base]`, register-indirect with no displacement (used
/// to read the thread-base address `tls_slot_to_offset` names). `base`
/// must not be ESP/EBP, which need a SIB byte or reserved-encoding
/// handling this never exercises in practice (`base` is always EAX).
fn emit_fs_mov_load_indirect(buf: &mut CodeBuffer, off: &mut usize, reg: u8, base: u8) {
    debug_assert!(base != 4 && base != 5);
    buf.push_u8(off, 0x64);
    buf.push_u8(off, 0x8B);
    buf.push_u8(off, emit::modrm_byte(emit::MOD_INDIRECT, reg, base));
}

fn emit_normal(buf: &mut CodeBuffer, off: &mut usize, code: &[u8], d: &dbt_decode::Decoded) {
    let prefix_len = if d.prefixes.opsize_prefix { 1 } else { 0 }
        + if d.prefixes.rep_prefix.is_some() { 1 } else { 0 };
    let opcode_len = if d.escape_0x0f { 2 } else { 1 };
    buf.push_bytes(off, &code[..prefix_len + opcode_len]);
    if let Some(m) = &d.modrm {
        let regen = emit::encode_rm(m.r, &m.rm);
        buf.push_bytes(off, &regen);
    }
    buf.push_bytes(off, d.imm);
}
