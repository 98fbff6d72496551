//! Shared state for the DBT: block descriptors and their hash index,
//! the code-cache bump allocator, label/relocation bookkeeping, and
//! scratch-register selection.
//!
//! This crate holds no byte-emission logic (`dbt-emit`), no decode
//! tables (`dbt-decode`), and no per-category translation logic
//! (`dbt-translate`) — it is the fixed-size bookkeeping all three, plus
//! `dbt-exec`, operate on.

pub mod block;
pub mod cache;
pub mod label;
pub mod regset;
pub mod stats;
pub mod tls;

pub use block::{hash, BlockDesc, BlockPool, BUCKETS, BLOCK_MAXSIZE};
pub use cache::{CacheFull, CodeCache, TRAMPOLINE_SIZE};
pub use label::{patch_reloc, Label, LabelUse, RelocKind};
pub use regset::{pick_scratch, Gpr, RegMask, SCRATCH_CANDIDATES};
pub use stats::{stats_enabled, DbtStats};
pub use tls::{tls_slot_to_offset, TLS_ENTRY_COUNT, TLS_ENTRY_MIN, TLS_SLOT_TABLE_OFFSET};
