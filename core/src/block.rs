//! Block descriptors and the hash-bucketed block pool.
//!
//! A block is the unit of translation: a maximal straight-line run of
//! guest instructions starting at some guest PC and ending at the first
//! control-transfer instruction. Blocks are fixed-capacity and bucket
//! hashed by guest PC, the same shape as QEMU's TB hash table but
//! without per-CPU jump caches or invalidation bookkeeping — this
//! translator is single-threaded and only ever invalidates everything
//! at once (see `BlockPool::flush`).

/// Protection/allocation unit shared with the host code cache.
pub const BLOCK_MAXSIZE: usize = 1024;

/// Number of hash buckets for the block index.
pub const BUCKETS: usize = 4096;

/// A translated basic block.
#[derive(Debug, Clone, Copy)]
pub struct BlockDesc {
    /// Guest PC this block starts at.
    pub guest_pc: u32,
    /// Offset into the code cache where the translated bytes start.
    pub cache_start: usize,
    /// Index of the next block in the same hash bucket, or `None`.
    hash_next: Option<u32>,
}

impl BlockDesc {
    fn new(guest_pc: u32, cache_start: usize) -> Self {
        Self {
            guest_pc,
            cache_start,
            hash_next: None,
        }
    }
}

/// `hash(pc) = (pc + (pc<<3) + (pc<<9)) mod BUCKETS`.
#[inline]
pub fn hash(pc: u32) -> usize {
    let h = pc
        .wrapping_add(pc.wrapping_shl(3))
        .wrapping_add(pc.wrapping_shl(9));
    (h as usize) & (BUCKETS - 1)
}

/// Fixed-capacity store of translated blocks, bucket-hashed by guest PC.
///
/// `find` walks a bucket chain, `alloc` hands out a fresh descriptor or
/// signals that the caller must flush.
pub struct BlockPool {
    blocks: Vec<BlockDesc>,
    buckets: [Option<u32>; BUCKETS],
    capacity: usize,
}

impl BlockPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(capacity),
            buckets: [None; BUCKETS],
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Walk `block_hash[hash(pc)]` for a block whose `guest_pc == pc`.
    pub fn find(&self, pc: u32) -> Option<&BlockDesc> {
        let mut cur = self.buckets[hash(pc)];
        while let Some(idx) = cur {
            let b = &self.blocks[idx as usize];
            if b.guest_pc == pc {
                return Some(b);
            }
            cur = b.hash_next;
        }
        None
    }

    /// Allocate a fresh descriptor for `pc` at `cache_start` and insert
    /// it into its bucket. Returns `None` if the descriptor pool is
    /// exhausted; the caller is responsible for checking cache-capacity
    /// separately and triggering a flush before calling this.
    pub fn alloc(&mut self, pc: u32, cache_start: usize) -> Option<u32> {
        if self.blocks.len() >= self.capacity {
            return None;
        }
        let idx = self.blocks.len() as u32;
        let bucket = hash(pc);
        let mut desc = BlockDesc::new(pc, cache_start);
        desc.hash_next = self.buckets[bucket];
        self.blocks.push(desc);
        self.buckets[bucket] = Some(idx);
        Some(idx)
    }

    pub fn get(&self, idx: u32) -> &BlockDesc {
        &self.blocks[idx as usize]
    }

    /// Empty every bucket and drop all descriptors. Trampoline stubs and
    /// all chaining displacements referencing them become garbage
    /// atomically; no code translated before the flush may execute
    /// after it.
    pub fn flush(&mut self) {
        self.blocks.clear();
        self.buckets = [None; BUCKETS];
    }
}
