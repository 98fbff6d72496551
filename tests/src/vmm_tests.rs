//! Cross-crate VMM behavior: page/protection/mapping invariants and
//! mmap/mprotect/munmap/fork scenarios, exercised entirely through
//! `vmm`'s public `VmmState`/`sys_*`/`MapList` surface, never its
//! private fields.

use vmm::{
    page_index, sys_brk, sys_mmap2, sys_munmap, MapEntry, MapList, VmmState, ALLOC_LOW,
    MAP_ANONYMOUS, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE,
};

fn new_vm() -> VmmState {
    VmmState::new().expect("failed to create vmm state")
}

/// P2: every page a live mapping covers has a nonzero `page_prot`, and
/// no page outside any mapping does.
#[test]
fn p2_page_prot_matches_mapping_coverage() {
    let _guard = crate::real_address_space_guard();
    let mut vm = new_vm();
    let addr = vm
        .mmap(0, 3 * 4096, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None)
        .unwrap();
    let base = page_index(addr);
    for i in 0..3 {
        assert_ne!(vm.page_prot(base + i), 0);
    }
    assert_eq!(vm.page_prot(base + 3), 0);
}

/// P4: `mmap` then `munmap` of exactly the same range restores
/// `page_prot` bit-for-bit (observed through the public accessor).
#[test]
fn p4_mmap_then_munmap_restores_page_prot() {
    let _guard = crate::real_address_space_guard();
    let mut vm = new_vm();
    let addr = vm
        .mmap(0, 3 * 4096, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None)
        .unwrap();
    let base = page_index(addr);
    for i in 0..3 {
        assert_ne!(vm.page_prot(base + i), 0);
    }

    vm.munmap(addr, 3 * 4096).unwrap();
    for i in 0..3 {
        assert_eq!(vm.page_prot(base + i), 0);
    }
}

/// P5: across a sequence of successful `mmap`/`mprotect`/`brk` calls,
/// `brk` never decreases.
#[test]
fn p5_brk_is_monotonically_non_decreasing() {
    let _guard = crate::real_address_space_guard();
    let mut vm = new_vm();
    vm.set_initial_brk(vmm::HEAP_BASE + 0x1000);
    let a = vm.sys_brk(vmm::HEAP_BASE + 0x5000);
    let b = vm.sys_brk(vmm::HEAP_BASE); // shrink request: must be a no-op
    let c = vm.sys_brk(vmm::HEAP_BASE + 0x9000);
    assert_eq!(b, a); // shrink never moves it backward
    assert!(c > b);
}

/// Scenario 4, literal: `mmap` 0x3000 bytes RW anon, `mprotect` the
/// middle page to R-only (splitting the protection map), `munmap` the
/// whole range and confirm every page goes back to unmapped.
#[test]
fn scenario_4_mmap_mprotect_munmap() {
    let _guard = crate::real_address_space_guard();
    let mut vm = new_vm();
    let addr = sys_mmap2(&mut vm, 0, 0x3000, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None);
    assert!(addr > 0);
    let addr = addr as u64;
    assert_eq!(addr % 4096, 0);

    let mid = addr + 0x1000;
    let r = vmm::sys_mprotect(&mut vm, mid, 0x1000, PROT_READ);
    assert_eq!(r, 0);

    let base = page_index(addr);
    assert_eq!(vm.page_prot(base), PROT_READ | PROT_WRITE);
    assert_eq!(vm.page_prot(base + 1), PROT_READ);
    assert_eq!(vm.page_prot(base + 2), PROT_READ | PROT_WRITE);

    let r = sys_munmap(&mut vm, addr, 0x3000);
    assert_eq!(r, 0);
    for i in 0..3 {
        assert_eq!(vm.page_prot(base + i), 0);
    }
}

/// An executable mapping followed by an `mmap` over the same fixed
/// range with a narrower protection exercises the `MAP_FIXED` overlap-
/// unmap-first rule through the public syscall wrappers.
#[test]
fn map_fixed_replaces_overlapping_mapping() {
    let _guard = crate::real_address_space_guard();
    let mut vm = new_vm();
    let addr = sys_mmap2(
        &mut vm,
        ALLOC_LOW,
        0x2000,
        PROT_READ | PROT_WRITE | PROT_EXEC,
        MAP_PRIVATE | MAP_ANONYMOUS | vmm::MAP_FIXED,
        None,
    );
    assert_eq!(addr as u64, ALLOC_LOW);

    let addr2 = sys_mmap2(
        &mut vm,
        ALLOC_LOW,
        0x1000,
        PROT_READ,
        MAP_PRIVATE | MAP_ANONYMOUS | vmm::MAP_FIXED,
        None,
    );
    assert_eq!(addr2 as u64, ALLOC_LOW);
    assert_eq!(vm.page_prot(page_index(ALLOC_LOW)), PROT_READ);
}

/// P3 on the re-exported `MapList` type directly: entries stay sorted
/// by `start_page` and pairwise disjoint no matter the insertion order.
#[test]
fn p3_map_list_stays_sorted_and_disjoint() {
    let entry = |start_page: u32, end_page: u32| MapEntry {
        start_page,
        end_page,
        file: None,
        offset_pages: 0,
    };
    let mut list = MapList::new();
    list.insert(entry(20, 25));
    list.insert(entry(0, 5));
    list.insert(entry(10, 15));

    let starts: Vec<u32> = list.iter().map(|e| e.start_page).collect();
    let mut sorted = starts.clone();
    sorted.sort_unstable();
    assert_eq!(starts, sorted);

    let mut prev_end = None;
    for e in list.iter() {
        if let Some(p) = prev_end {
            assert!(e.start_page >= p);
        }
        prev_end = Some(e.end_page);
    }
}

/// P6 / scenario 5: after `fork`, a page writable in the parent is
/// write-protected in both processes until a fault; the child's first
/// touch duplicates its section and still observes the pre-fork byte,
/// independent of whatever the parent later writes to its own copy.
#[test]
fn p6_scenario_5_fork_write_protects_then_faults_duplicate() {
    let _guard = crate::real_address_space_guard();
    let mut vm = new_vm();
    let addr = vm
        .mmap(0, 4096, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None)
        .unwrap();
    unsafe {
        (addr as usize as *mut u8).write(1);
    }

    match vm.fork().expect("fork failed") {
        vmm::ForkOutcome::Parent { child_pid } => {
            assert!(vm.handle_page_fault(addr), "parent's first write after fork must fault-duplicate");
            unsafe {
                (addr as usize as *mut u8).write(2);
            }
            let mut status: i32 = 0;
            unsafe { libc::waitpid(child_pid, &mut status, 0) };
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0, "child observed an unexpected byte after its own fault");
            let byte = unsafe { *(addr as usize as *const u8) };
            assert_eq!(byte, 2);
        }
        vmm::ForkOutcome::Child => {
            vm.handle_page_fault(addr);
            let byte = unsafe { *(addr as usize as *const u8) };
            unsafe { libc::_exit(if byte == 1 { 0 } else { 1 }) };
        }
    }
}
