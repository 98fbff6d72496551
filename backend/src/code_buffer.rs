use std::io;
use std::ptr;

use dbt_core::CodeCache;

/// Executable code cache, mmap-backed and W^X: writable while the
/// translator is emitting a block, executable while the guest runs it.
/// Never both at once, matching the host's W^X enforcement.
pub struct CodeBuffer {
    base: *mut u8,
    len: usize,
    cache: CodeCache,
    writable: bool,
}

// SAFETY: CodeBuffer owns its mmap'd region exclusively; the DBT is
// single-threaded, so no concurrent access needs guarding.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    pub fn new(len: usize) -> io::Result<Self> {
        // SAFETY: anonymous, private mapping; no file descriptor
        // involved.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: ptr as *mut u8,
            len,
            cache: CodeCache::new(len),
            writable: true,
        })
    }

    pub fn set_writable(&mut self) -> io::Result<()> {
        if self.writable {
            return Ok(());
        }
        self.mprotect(libc::PROT_READ | libc::PROT_WRITE)?;
        self.writable = true;
        Ok(())
    }

    pub fn set_executable(&mut self) -> io::Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.mprotect(libc::PROT_READ | libc::PROT_EXEC)?;
        self.writable = false;
        Ok(())
    }

    fn mprotect(&self, prot: i32) -> io::Result<()> {
        let ret = unsafe {
            libc::mprotect(self.base as *mut libc::c_void, self.len, prot)
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn out(&self) -> usize {
        self.cache.out()
    }

    pub fn end(&self) -> usize {
        self.cache.end()
    }

    pub fn remaining(&self) -> usize {
        self.cache.remaining()
    }

    pub fn align_out_16(&mut self) {
        self.cache.align_out_16()
    }

    /// Reserve `n` bytes growing upward from `out`, keeping the
    /// `BLOCK_MAXSIZE` worst-case margin against `end`.
    pub fn reserve(&mut self, n: usize) -> Result<usize, dbt_core::CacheFull> {
        self.cache.reserve_out(n)
    }

    /// Bump-allocate a 16-byte trampoline stub from the high end.
    pub fn alloc_trampoline(&mut self) -> Result<usize, dbt_core::CacheFull> {
        self.cache.alloc_trampoline()
    }

    /// Reset the cursors. Caller must also flush the block pool; the
    /// bytes themselves are left in place and simply overwritten by
    /// subsequent translation (they are never read once the pool no
    /// longer references them).
    pub fn flush(&mut self) {
        self.cache.reset();
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.base as *const u8
    }

    pub fn ptr_at(&self, offset: usize) -> *const u8 {
        assert!(offset <= self.len);
        unsafe { self.base.add(offset) }
    }

    pub fn ptr_at_mut(&mut self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len);
        unsafe { self.base.add(offset) }
    }

    /// Write a single byte at `out` and advance. Caller must have
    /// reserved enough room via `reserve`.
    pub fn push_u8(&mut self, offset: &mut usize, b: u8) {
        unsafe { *self.base.add(*offset) = b };
        *offset += 1;
    }

    pub fn push_bytes(&mut self, offset: &mut usize, bytes: &[u8]) {
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(*offset), bytes.len());
        }
        *offset += bytes.len();
    }

    pub fn push_u32_le(&mut self, offset: &mut usize, v: u32) {
        self.push_bytes(offset, &v.to_le_bytes());
    }

    pub fn push_i32_le(&mut self, offset: &mut usize, v: i32) {
        self.push_bytes(offset, &v.to_le_bytes());
    }

    /// Overwrite an already-emitted 32-bit little-endian field (used by
    /// chain-patching: rewriting a trampoline displacement in place).
    pub fn patch_u32_le(&self, offset: usize, v: u32) {
        unsafe {
            (self.base.add(offset) as *mut u32).write_unaligned(v);
        }
    }

    pub fn patch_i32_le(&self, offset: usize, v: i32) {
        self.patch_u32_le(offset, v as u32)
    }

    /// Read back already-emitted bytes (used by the `blockdump` tool).
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_starts_writable_and_empty() {
        let buf = CodeBuffer::new(4096).unwrap();
        assert_eq!(buf.out(), 0);
        assert_eq!(buf.end(), 4096);
    }

    #[test]
    fn push_and_read_roundtrip() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        let mut off = buf.reserve(4).unwrap();
        let start = off;
        buf.push_bytes(&mut off, &[0x90, 0x90, 0xC3, 0x00]);
        assert_eq!(buf.read(start, 3), &[0x90, 0x90, 0xC3]);
    }

    #[test]
    fn patch_u32_overwrites_in_place() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        let mut off = buf.reserve(4).unwrap();
        let start = off;
        buf.push_u32_le(&mut off, 0);
        buf.patch_u32_le(start, 0xdead_beef);
        assert_eq!(buf.read(start, 4), &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    fn flush_resets_cursors_without_unmapping() {
        let mut buf = CodeBuffer::new(4096).unwrap();
        buf.reserve(100).unwrap();
        buf.alloc_trampoline().unwrap();
        buf.flush();
        assert_eq!(buf.out(), 0);
        assert_eq!(buf.end(), 4096);
    }
}
