//! Per-instruction translator: turns one guest basic block into host
//! bytes in the code cache, emitting direct trampolines for
//! control-transfer terminators as it goes.

pub mod error;
pub mod trampoline;
pub mod translate;

pub use error::{fatal_opcode, fatal_prefix};
pub use trampoline::get_direct_trampoline;
pub use translate::{translate_block, DispatchTargets, GsSlots, GuestMemory};
