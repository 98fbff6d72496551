//! VMM state and the operations hung off it: `mmap`,
//! `munmap`, `mprotect`, `brk`, the page-fault handler, and `fork`.

use std::io;
use std::sync::Arc;

use crate::map_list::{FileBacking, MapEntry, MapList};
use crate::pager::{HostPager, LinuxPager, Section};
use crate::{
    block_base, block_index, page_align_up, page_count_for, page_index, prot_linux_to_host,
    ALLOC_HIGH, ALLOC_LOW, BLOCK_COUNT, HEAP_BASE, MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE,
    MAP_SHARED, PAGE_COUNT, PAGE_SIZE, PROT_WRITE, __MAP_HEAP,
};

/// Positive Linux errno; `sys.rs` negates it for the guest-visible
/// return value as a negative Linux errno.
pub type Errno = i32;

/// A request to back the mapped range with file content, read
/// eagerly at map time rather than demand-paged.
pub struct FileRequest<'a> {
    pub file: &'a Arc<dyn FileBacking>,
    pub offset_pages: u32,
}

pub enum ForkOutcome {
    Parent { child_pid: i32 },
    Child,
}

pub struct VmmState<P: HostPager = LinuxPager> {
    /// Guest-visible protection per page; `0` means unmapped.
    page_prot: Vec<u8>,
    block_page_count: Vec<u16>,
    block_section: Vec<Option<Section>>,
    /// Set on a page whose *host* write permission is being withheld to
    /// enforce a pending COW duplication, independent of
    /// the guest-visible `page_prot` bit, which `mprotect` always leaves
    /// untouched (see DESIGN.md for why the two bits are kept separate).
    host_write_blocked: Vec<bool>,
    map_list: MapList,
    brk: u64,
    /// Page-aligned high-water mark of what `brk` has actually had
    /// mapped for it so far; growth only `mmap`s the delta.
    brk_mapped_end: u64,
    pager: P,
}

impl VmmState<LinuxPager> {
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_pager(LinuxPager::new()?))
    }
}

impl<P: HostPager> VmmState<P> {
    pub fn with_pager(pager: P) -> Self {
        Self {
            page_prot: vec![0; PAGE_COUNT],
            block_page_count: vec![0; BLOCK_COUNT],
            block_section: (0..BLOCK_COUNT).map(|_| None).collect(),
            host_write_blocked: vec![false; PAGE_COUNT],
            map_list: MapList::new(),
            brk: HEAP_BASE,
            brk_mapped_end: HEAP_BASE,
            pager,
        }
    }

    pub fn brk(&self) -> u64 {
        self.brk
    }

    /// Called once by the loader after the ELF image + initial `.bss`
    /// are in place, to seed where `brk` growth starts from.
    pub fn set_initial_brk(&mut self, addr: u64) {
        self.brk = addr;
        self.brk_mapped_end = page_align_up(addr);
    }

    pub fn page_prot(&self, page: usize) -> u8 {
        self.page_prot[page]
    }

    /// Drop every user mapping and reset `brk`, the way `execve`
    /// drops all user regions. Translator state is reset
    /// separately by `dbt-exec`.
    pub fn reset(&mut self) {
        let all = self.map_list.iter().map(|e| (e.start_page, e.end_page)).collect::<Vec<_>>();
        for (s, e) in all {
            let _ = self.munmap_pages(s, e);
        }
        self.brk = HEAP_BASE;
        self.brk_mapped_end = HEAP_BASE;
    }

    // -----------------------------------------------------------------
    // mmap
    // -----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &mut self,
        addr: u64,
        length: u64,
        prot: u8,
        flags: u32,
        file: Option<FileRequest<'_>>,
    ) -> Result<u64, Errno> {
        if length == 0 {
            return Err(libc::EINVAL);
        }
        if flags & MAP_SHARED != 0 {
            return Err(libc::EINVAL);
        }
        let anon = flags & MAP_ANONYMOUS != 0;
        if anon && file.is_some() {
            return Err(libc::EINVAL);
        }
        if !anon && file.is_none() {
            return Err(libc::EBADF);
        }

        let npages = page_count_for(length);
        let fixed = flags & MAP_FIXED != 0;

        let start_page = if fixed {
            if addr % PAGE_SIZE != 0 {
                return Err(libc::EINVAL);
            }
            let start_page = (addr / PAGE_SIZE) as u32;
            let end_page = start_page + npages as u32;
            self.munmap_pages(start_page, end_page).map_err(|_| libc::EINVAL)?;
            start_page
        } else {
            let (low, high) = if flags & __MAP_HEAP != 0 {
                (HEAP_BASE, ALLOC_LOW)
            } else {
                (ALLOC_LOW, ALLOC_HIGH)
            };
            self.find_free_run(npages, low, high).ok_or(libc::ENOMEM)?
        };
        let end_page = start_page + npages as u32;
        if (end_page as u64) * PAGE_SIZE > crate::GUEST_ADDR_LIMIT {
            return Err(libc::EINVAL);
        }

        let first_block = block_index(start_page as u64 * PAGE_SIZE);
        let last_block = block_index((end_page as u64 - 1) * PAGE_SIZE);

        let mut created_blocks = Vec::new();
        for b in first_block..=last_block {
            if self.block_section[b].is_none() {
                let host_prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
                match self.pager.create_and_map(b, host_prot) {
                    Ok(sec) => {
                        self.block_section[b] = Some(sec);
                        created_blocks.push(b);
                    }
                    Err(e) => {
                        for cb in created_blocks {
                            if let Some(sec) = self.block_section[cb].take() {
                                let _ = self.pager.unmap_at(cb);
                                self.pager.close(sec);
                            }
                        }
                        eprintln!("mmap: create_and_map block {b} failed: {e}");
                        return Err(libc::ENOMEM);
                    }
                }
            }
        }

        // Resolved open question: the host mapping is forced
        // writable while the file content loads, then narrowed to the
        // guest-requested `prot` below regardless of what was asked for
        // here — no leaked PROT_WRITE survives past this block.
        let effective_prot = prot;
        if let Some(req) = &file {
            let base_addr = start_page as u64 * PAGE_SIZE;
            let host_rw = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
            for b in first_block..=last_block {
                let _ = self.pager.protect(b, 0, crate::PAGES_PER_BLOCK as usize, host_rw);
            }
            let ptr = base_addr as *mut u8;
            let want = npages as usize * PAGE_SIZE as usize;
            let buf = unsafe { std::slice::from_raw_parts_mut(ptr, want) };
            let mut off = 0usize;
            let file_offset = req.offset_pages as u64 * PAGE_SIZE;
            while off < want {
                match req.file.pread(&mut buf[off..], file_offset + off as u64) {
                    Ok(0) => break,
                    Ok(n) => off += n,
                    Err(e) => {
                        eprintln!("mmap: file read failed: {e}");
                        break;
                    }
                }
            }
        }

        self.map_list.insert(MapEntry {
            start_page,
            end_page,
            file: file.as_ref().map(|f| Arc::clone(f.file)),
            offset_pages: file.as_ref().map(|f| f.offset_pages).unwrap_or(0),
        });

        for p in start_page..end_page {
            self.page_prot[p as usize] = effective_prot;
            self.host_write_blocked[p as usize] = false;
            let b = block_index(p as u64 * PAGE_SIZE);
            self.block_page_count[b] += 1;
        }
        for b in first_block..=last_block {
            let off = page_off_in_block(b, start_page, end_page);
            if let Some((page_off, count)) = off {
                let _ = self
                    .pager
                    .protect(b, page_off, count, prot_linux_to_host(effective_prot));
            }
        }

        Ok(start_page as u64 * PAGE_SIZE)
    }

    fn find_free_run(&self, npages: u64, low: u64, high: u64) -> Option<u32> {
        let lo_page = (low / PAGE_SIZE) as u32;
        let hi_page = (high / PAGE_SIZE) as u32;
        let npages = npages as u32;
        let mut run_start = lo_page;
        let mut run_len = 0u32;
        for p in lo_page..hi_page {
            if self.page_prot[p as usize] == 0 {
                if run_len == 0 {
                    run_start = p;
                }
                run_len += 1;
                if run_len >= npages {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // munmap
    // -----------------------------------------------------------------

    pub fn munmap(&mut self, addr: u64, length: u64) -> Result<(), Errno> {
        if length == 0 {
            return Err(libc::EINVAL);
        }
        let start_page = (addr / PAGE_SIZE) as u32;
        let end_page = start_page + page_count_for(length) as u32;
        self.munmap_pages(start_page, end_page).map_err(|_| libc::EINVAL)
    }

    fn munmap_pages(&mut self, start_page: u32, end_page: u32) -> io::Result<()> {
        let _dead = self.map_list.remove_range(start_page, end_page);
        for p in start_page..end_page {
            if self.page_prot[p as usize] == 0 {
                continue;
            }
            self.page_prot[p as usize] = 0;
            self.host_write_blocked[p as usize] = false;
            let b = block_index(p as u64 * PAGE_SIZE);
            self.block_page_count[b] -= 1;
            if self.block_page_count[b] == 0 {
                if let Some(sec) = self.block_section[b].take() {
                    self.pager.unmap_at(b)?;
                    self.pager.close(sec);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // mprotect
    // -----------------------------------------------------------------

    pub fn mprotect(&mut self, addr: u64, length: u64, prot: u8) -> Result<(), Errno> {
        if length == 0 {
            return Err(libc::EINVAL);
        }
        let start_page = (addr / PAGE_SIZE) as u32;
        let end_page = start_page + page_count_for(length) as u32;
        if !self.map_list.fully_covers_contiguous(start_page, end_page) {
            return Err(libc::ENOMEM);
        }

        let mut p = start_page;
        while p < end_page {
            let run_start = p;
            let prior = self.page_prot[p as usize];
            while p < end_page && self.page_prot[p as usize] == prior {
                p += 1;
            }
            for q in run_start..p {
                self.page_prot[q as usize] = prot;
            }
            // Apply per block (a run may span a block boundary).
            let mut q = run_start;
            while q < p {
                let b = block_index(q as u64 * PAGE_SIZE);
                let block_end_page = ((block_base(b) + crate::BLOCK_SIZE) / PAGE_SIZE) as u32;
                let run_end_in_block = p.min(block_end_page);
                let page_off = (q as u64 * PAGE_SIZE - block_base(b)) / PAGE_SIZE;
                let count = (run_end_in_block - q) as usize;
                let mut host_prot = prot_linux_to_host(prot);
                if self.host_write_blocked[q as usize] {
                    host_prot &= !libc::PROT_WRITE;
                }
                let _ = self.pager.protect(b, page_off as usize, count, host_prot);
                q = run_end_in_block;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // brk
    // -----------------------------------------------------------------

    pub fn sys_brk(&mut self, addr: u64) -> u64 {
        if addr <= self.brk {
            return self.brk;
        }
        let new_end = page_align_up(addr);
        if new_end > self.brk_mapped_end {
            let len = new_end - self.brk_mapped_end;
            let prot = crate::PROT_READ | crate::PROT_WRITE | crate::PROT_EXEC;
            let flags = MAP_FIXED | MAP_ANONYMOUS | MAP_PRIVATE;
            match self.mmap(self.brk_mapped_end, len, prot, flags, None) {
                Ok(_) => self.brk_mapped_end = new_end,
                Err(_) => return self.brk,
            }
        }
        self.brk = addr;
        self.brk
    }

    // -----------------------------------------------------------------
    // Page fault handler / COW
    // -----------------------------------------------------------------

    pub fn handle_page_fault(&mut self, addr: u64) -> bool {
        if addr >= crate::GUEST_ADDR_LIMIT {
            return false;
        }
        let page = page_index(addr);
        if self.page_prot[page] & PROT_WRITE == 0 {
            return false;
        }
        let block = block_index(addr);
        if self.block_section[block].is_none() {
            return false;
        }

        let owners = {
            let sec = self.block_section[block].as_ref().unwrap();
            self.pager.owner_count(sec)
        };

        if owners > 1 {
            let old = self.block_section[block].take().unwrap();
            match self.pager.duplicate(&old, block) {
                Ok(new_sec) => {
                    self.pager.dec_owner(&old);
                    self.pager.close(old);
                    self.block_section[block] = Some(new_sec);
                }
                Err(e) => {
                    eprintln!("page fault: duplicate block {block} failed: {e}");
                    // Put the old handle back so state stays consistent.
                    self.block_section[block] = Some(old);
                    return false;
                }
            }
        }

        let block_start_page = (block_base(block) / PAGE_SIZE) as usize;
        for i in 0..crate::PAGES_PER_BLOCK as usize {
            self.host_write_blocked[block_start_page + i] = false;
        }
        for (page_off, count) in contiguous_runs(&self.page_prot, block_start_page, crate::PAGES_PER_BLOCK as usize) {
            let prot = self.page_prot[block_start_page + page_off];
            let _ = self.pager.protect(block, page_off, count, prot_linux_to_host(prot));
        }
        true
    }

    // -----------------------------------------------------------------
    // fork
    // -----------------------------------------------------------------

    /// Write-protect every currently-writable page shared by a live
    /// section, bump its owner count, then `fork()`. The child inherits
    /// the now-read-only view automatically (fork duplicates VMAs with
    /// their current protection), giving the P6 invariant in both
    /// processes without any post-fork syscalls.
    pub fn fork(&mut self) -> io::Result<ForkOutcome> {
        for b in 0..BLOCK_COUNT {
            if self.block_section[b].is_none() {
                continue;
            }
            let block_start_page = (block_base(b) / PAGE_SIZE) as usize;
            let any_writable = (0..crate::PAGES_PER_BLOCK as usize)
                .any(|i| self.page_prot[block_start_page + i] & PROT_WRITE != 0);
            if !any_writable {
                continue;
            }
            for i in 0..crate::PAGES_PER_BLOCK as usize {
                if self.page_prot[block_start_page + i] & PROT_WRITE != 0 {
                    self.host_write_blocked[block_start_page + i] = true;
                }
            }
            for (page_off, count) in
                contiguous_runs(&self.page_prot, block_start_page, crate::PAGES_PER_BLOCK as usize)
            {
                let prot = self.page_prot[block_start_page + page_off];
                let mut host_prot = prot_linux_to_host(prot);
                host_prot &= !libc::PROT_WRITE;
                let _ = self.pager.protect(b, page_off, count, host_prot);
            }
            let sec = self.block_section[b].as_ref().unwrap();
            self.pager.inc_owner(sec);
        }

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            Ok(ForkOutcome::Child)
        } else {
            Ok(ForkOutcome::Parent { child_pid: pid })
        }
    }
}

/// `(block_addr - start) / PAGE_SIZE, page_count` for the overlap of
/// `[start_page, end_page)` with block `b`, or `None` if disjoint.
fn page_off_in_block(b: usize, start_page: u32, end_page: u32) -> Option<(usize, usize)> {
    let block_start = (block_base(b) / PAGE_SIZE) as u32;
    let block_end = block_start + crate::PAGES_PER_BLOCK as u32;
    let lo = start_page.max(block_start);
    let hi = end_page.min(block_end);
    if lo >= hi {
        return None;
    }
    Some(((lo - block_start) as usize, (hi - lo) as usize))
}

/// Maximal runs of pages within `[base_page, base_page + count)` that
/// share the same `page_prot` value, as `(offset_from_base, run_len)`.
fn contiguous_runs(page_prot: &[u8], base_page: usize, count: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < count {
        let start = i;
        let v = page_prot[base_page + i];
        while i < count && page_prot[base_page + i] == v {
            i += 1;
        }
        runs.push((start, i - start));
    }
    runs
}

mod log {
    pub fn error(msg: &str) {
        eprintln!("[vmm] {msg}");
    }
}
