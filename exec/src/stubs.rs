//! Assembly dispatch stubs and the Rust trampolines they call out to.
//!
//! Guest and host share one IA-32 register file and one address space:
//! there is no emulated register bank anywhere in this crate. Running
//! guest code means loading the real EAX..EDI/ESP with guest values and jumping
//! into the code cache; a "guest register" *is* a host register for as
//! long as guest code is on the CPU. This whole crate only makes sense
//! built for an `i686-unknown-linux-gnu` target — see `DESIGN.md`.
//!
//! Three stubs live in the code cache's caller sites or are jumped/
//! called into from translated code:
//!
//! - `dbt_find_direct_internal`: landed on via `jmp` from a direct
//!   trampoline (`[esp]=target_pc`, `[esp+4]=patch_addr`).
//! - `dbt_find_indirect_internal`: landed on via `jmp` with
//!   `[esp]=target_pc` only.
//! - `dbt_syscall_entry`: landed on via `call` for `INT 0x80`; returns
//!   normally (continuing the block) unless the guest asked to exit.
//!
//! All three save every GPR and EFLAGS with `pushfd; pushad` before
//! calling into Rust, so a translated block never has to know its
//! registers might transiently live somewhere else. `dbt_enter`/
//! `dbt_host_return` are the matching pair that cross from "running
//! the translator's own stack" to "running on the guest's stack" and
//! back, swapping out the five callee-saved host registers through
//! `DBT_HOST_CTX` rather than a normal `ret`-based unwind, since the
//! guest may jump through any number of cache blocks before either
//! calling back out (exit) or never returning at all.

use std::cell::RefCell;

use dbt_translate::GuestMemory;

use crate::engine::Engine;
use crate::regs::{GuestRegs, SyscallOutcome};
use crate::SyscallHandler;

#[no_mangle]
static mut DBT_RESOLVED_TARGET: u32 = 0;
#[no_mangle]
static mut DBT_ENTRY_TARGET: u32 = 0;
#[no_mangle]
static mut DBT_EXIT_CODE: i32 = 0;
/// `[host_esp, host_ebx, host_esi, host_edi, host_ebp]`, captured by
/// `dbt_enter` right after its own prologue and restored verbatim by
/// `dbt_host_return`.
#[no_mangle]
static mut DBT_HOST_CTX: [u32; 5] = [0; 5];

std::arch::global_asm!(
    ".text",
    ".global dbt_find_direct_internal",
    "dbt_find_direct_internal:",
    "    pushfd",
    "    pushad",
    "    mov eax, [esp+40]",     // patch_addr
    "    push eax",
    "    mov eax, [esp+40]",     // target_pc (esp moved by the push above)
    "    push eax",
    "    call dbt_find_direct_trampoline",
    "    add esp, 8",
    "    mov [DBT_RESOLVED_TARGET], eax",
    "    popad",
    "    popfd",
    "    add esp, 8",            // drop the trampoline's [target_pc, patch_addr]
    "    jmp dword ptr [DBT_RESOLVED_TARGET]",

    ".global dbt_find_indirect_internal",
    "dbt_find_indirect_internal:",
    "    pushfd",
    "    pushad",
    "    mov eax, [esp+36]",     // target_pc
    "    push eax",
    "    call dbt_find_indirect_trampoline",
    "    add esp, 4",
    "    mov [DBT_RESOLVED_TARGET], eax",
    "    popad",
    "    popfd",
    "    add esp, 4",            // drop the trampoline's [target_pc]
    "    jmp dword ptr [DBT_RESOLVED_TARGET]",

    ".global dbt_syscall_entry",
    "dbt_syscall_entry:",
    "    pushfd",
    "    pushad",
    "    push esp",              // &GuestRegs == base of the pushad block
    "    call dbt_syscall_trampoline",
    "    add esp, 4",
    "    test eax, eax",
    "    jnz 2f",
    "    popad",
    "    popfd",
    "    ret",                   // INT 0x80 continues the block
    "2:",
    "    popad",
    "    popfd",
    "    add esp, 4",            // drop the call's own return address
    "    jmp dbt_host_return",

    // extern "C" fn dbt_enter(entry_addr: u32, regs: *const GuestRegs) -> i32
    ".global dbt_enter",
    "dbt_enter:",
    "    push ebp",
    "    mov ebp, esp",
    "    push ebx",
    "    push esi",
    "    push edi",
    "    mov [DBT_HOST_CTX+0], esp",
    "    mov [DBT_HOST_CTX+4], ebx",
    "    mov [DBT_HOST_CTX+8], esi",
    "    mov [DBT_HOST_CTX+12], edi",
    "    mov [DBT_HOST_CTX+16], ebp",
    "    mov eax, [ebp+8]",       // entry_addr
    "    mov [DBT_ENTRY_TARGET], eax",
    "    mov ecx, [ebp+12]",      // regs ptr
    "    mov edi, [ecx+0]",
    "    mov esi, [ecx+4]",
    "    mov ebx, [ecx+16]",
    "    mov edx, [ecx+20]",
    "    mov eax, [ecx+28]",
    "    push dword ptr [ecx+12]", // guest esp (popped last)
    "    push dword ptr [ecx+8]",  // guest ebp (popped second)
    "    push dword ptr [ecx+24]", // guest ecx (popped first)
    "    pop ecx",
    "    pop ebp",
    "    pop esp",
    "    jmp dword ptr [DBT_ENTRY_TARGET]",

    // Landed on from dbt_syscall_entry on an exit request. Never called
    // directly; restores the five host registers dbt_enter stashed and
    // returns to dbt_enter's caller exactly as if dbt_enter itself had
    // returned DBT_EXIT_CODE.
    ".global dbt_host_return",
    "dbt_host_return:",
    "    mov eax, [DBT_HOST_CTX+0]",
    "    add eax, 16",            // skip ebx/esi/edi/ebp restored below, land on the return address
    "    mov esp, eax",
    "    mov ebx, [DBT_HOST_CTX+4]",
    "    mov esi, [DBT_HOST_CTX+8]",
    "    mov edi, [DBT_HOST_CTX+12]",
    "    mov ebp, [DBT_HOST_CTX+16]",
    "    mov eax, [DBT_EXIT_CODE]",
    "    ret",

    // Called directly (not jmp'd) from the MOV_TO_SEG sequence with the
    // TLS entry number in eax; returns the fs-relative byte offset of
    // that entry's resolved base in eax. No pushad/pushfd here, the
    // caller already saved eax/ecx/edx and EFLAGS around this call.
    ".global dbt_tls_slot_to_offset_internal",
    "dbt_tls_slot_to_offset_internal:",
    "    push eax",
    "    call dbt_tls_slot_to_offset_trampoline",
    "    add esp, 4",
    "    ret",
);

extern "C" {
    pub fn dbt_find_direct_internal();
    pub fn dbt_find_indirect_internal();
    pub fn dbt_syscall_entry();
    pub fn dbt_enter(entry_addr: u32, regs: *const GuestRegs) -> i32;
    pub fn dbt_tls_slot_to_offset_internal();
}

/// The engine/memory/handler triple currently "inside" `dbt_enter`.
/// Raw pointers, not borrows: the lifetime is enforced by `dbt_run`
/// clearing this before its borrows end, not by the type system, since
/// the assembly stubs above can only call plain `extern "C" fn`s.
struct RuntimeRaw {
    engine: *mut Engine,
    mem: *const dyn GuestMemory,
    handler: *mut dyn SyscallHandler,
}

thread_local! {
    static RUNTIME: RefCell<Option<RuntimeRaw>> = RefCell::new(None);
}

pub(crate) fn enter_runtime(engine: *mut Engine, mem: *const dyn GuestMemory, handler: *mut dyn SyscallHandler) {
    RUNTIME.with(|c| *c.borrow_mut() = Some(RuntimeRaw { engine, mem, handler }));
}

pub(crate) fn leave_runtime() {
    RUNTIME.with(|c| *c.borrow_mut() = None);
}

fn with_runtime<R>(f: impl FnOnce(&mut Engine, &dyn GuestMemory, &mut dyn SyscallHandler) -> R) -> R {
    RUNTIME.with(|c| {
        let borrow = c.borrow();
        let rt = borrow
            .as_ref()
            .expect("dbt dispatch stub invoked with no active dbt_run");
        // SAFETY: the pointers are valid for as long as an entry exists
        // in RUNTIME, which dbt_run guarantees spans every call the
        // assembly stubs can make back into Rust.
        unsafe { f(&mut *rt.engine, &*rt.mem, &mut *rt.handler) }
    })
}

#[no_mangle]
extern "C" fn dbt_find_direct_trampoline(target_pc: u32, patch_addr: u32) -> u32 {
    with_runtime(|engine, mem, _handler| engine.find_direct(mem, target_pc, patch_addr as usize) as u32)
}

#[no_mangle]
extern "C" fn dbt_find_indirect_trampoline(target_pc: u32) -> u32 {
    with_runtime(|engine, mem, _handler| engine.find_indirect(mem, target_pc) as u32)
}

/// Pure arithmetic, no engine/memory/handler involved, so this does not
/// go through `with_runtime` — it works even in `dbt-exec`'s own unit
/// tests, which never call `dbt_run`.
#[no_mangle]
extern "C" fn dbt_tls_slot_to_offset_trampoline(slot: u32) -> i32 {
    dbt_core::tls_slot_to_offset(slot)
}

#[no_mangle]
extern "C" fn dbt_syscall_trampoline(regs: *mut GuestRegs) -> u32 {
    with_runtime(|_engine, _mem, handler| {
        // SAFETY: regs points at the live pushad block on the guest
        // stack for the duration of this call.
        let regs = unsafe { &mut *regs };
        match handler.syscall(regs) {
            SyscallOutcome::Continue => 0,
            SyscallOutcome::Exit(code) => {
                unsafe { DBT_EXIT_CODE = code };
                1
            }
        }
    })
}
