//! fs-relative TLS slot-table layout shared between `dbt-exec`'s
//! `MOV_TO_SEG` resolver stub and `linux-user`'s guest
//! `set_thread_area` emulation, so the two stay in lockstep without
//! either crate depending on the other.
//!
//! `linux-user`'s TLS installer lays out one fixed block per process:
//! three translator-visible header words (`scratch`, `gs`, `gs_addr`,
//! addressed directly through `dbt_translate::GsSlots`) followed by a
//! small table of resolved thread-base addresses, one per allocated
//! TLS entry, that only `tls_alloc`/`tls_slot_to_offset` ever touch.

/// Lowest GDT entry number Linux/i386 hands out for `set_thread_area`
/// (`GDT_ENTRY_TLS_MIN`).
pub const TLS_ENTRY_MIN: u32 = 6;
/// Number of TLS entries the kernel reserves (`GDT_ENTRY_TLS_ENTRIES`).
pub const TLS_ENTRY_COUNT: u32 = 3;
/// Byte offset of the slot table within the TLS block, right after the
/// three header words.
pub const TLS_SLOT_TABLE_OFFSET: i32 = 12;

/// fs-relative byte offset of the resolved thread-base address for TLS
/// entry `slot` (the value a translated `MOV_TO_SEG` leaves in `eax`
/// after shifting the selector right 3). Out-of-range entries clamp to
/// the last allocated slot rather than reading past the table.
pub fn tls_slot_to_offset(slot: u32) -> i32 {
    let idx = slot.saturating_sub(TLS_ENTRY_MIN).min(TLS_ENTRY_COUNT - 1);
    TLS_SLOT_TABLE_OFFSET + (idx * 4) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_maps_to_table_start() {
        assert_eq!(tls_slot_to_offset(TLS_ENTRY_MIN), TLS_SLOT_TABLE_OFFSET);
    }

    #[test]
    fn second_entry_is_one_word_further() {
        assert_eq!(tls_slot_to_offset(TLS_ENTRY_MIN + 1), TLS_SLOT_TABLE_OFFSET + 4);
    }

    #[test]
    fn out_of_range_clamps_to_last_slot() {
        let last = TLS_SLOT_TABLE_OFFSET + ((TLS_ENTRY_COUNT - 1) * 4) as i32;
        assert_eq!(tls_slot_to_offset(TLS_ENTRY_MIN + 50), last);
    }

    #[test]
    fn below_range_clamps_to_first_slot() {
        assert_eq!(tls_slot_to_offset(0), TLS_SLOT_TABLE_OFFSET);
    }
}
