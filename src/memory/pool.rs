//! # Slab Pool Implementation
//!
//! Fixed-block allocator over a single contiguous, cache-aligned region.
//! The tree engine draws node blocks from here; allocation and release are
//! O(1) pops and pushes on an intrusive free list.
//!
//! ## Design
//!
//! ```text
//! +--------------------------------------------------------------+
//! | block 0     | block 1     | block 2     | ...  | block N-1   |
//! +--------------------------------------------------------------+
//!   ^ region start, aligned to the cache line (64 bytes)
//!     block_size is rounded up to 64, so every block starts on a
//!     cache line and satisfies any payload alignment up to 64
//! ```
//!
//! Free blocks store the index of the next free block in their first four
//! bytes, so the free list needs no side allocation. `NIL_BLOCK` terminates
//! the chain.
//!
//! ## Block Handles
//!
//! Callers address blocks by [`BlockId`] (the block's index in the region)
//! rather than by raw pointer. This keeps parent/child references in the
//! tree compact, makes `contains` an O(1) range test, and removes pointer
//! cycles from the ownership graph: the pool owns the memory, holders of a
//! `BlockId` merely refer to it.
//!
//! ## Sharing
//!
//! The pool is `Clone` (shared via `Arc`) and `Send + Sync`: the free list
//! sits behind a `parking_lot::Mutex`, acquired by every mutating op. The
//! `THREAD_SAFE` flag records that the pool is intentionally shared between
//! trees; the guard itself is unconditional. Ownership of a *block's
//! contents* belongs to whoever allocated it; the pool never reads or
//! writes issued blocks.
//!
//! ## Failure Modes
//!
//! `alloc` fails silently (returns `None`) when the region is exhausted.
//! `free` of a pointer outside the region, or not on a block boundary, is
//! ignored.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use crate::config::{MAX_POOL_SIZE, MIN_POOL_SIZE, POOL_ALIGNMENT};
use crate::error::TreeError;

/// Index of a block inside its pool region.
pub type BlockId = u32;

/// Terminator of the intrusive free chain; never a valid block index.
pub const NIL_BLOCK: BlockId = u32::MAX;

/// Pool configuration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolFlags(u32);

impl PoolFlags {
    /// No flags set.
    pub const NONE: PoolFlags = PoolFlags(0);
    /// Issued blocks are zeroed before return.
    pub const ZERO_MEMORY: PoolFlags = PoolFlags(1);
    /// The pool is intentionally shared across trees.
    pub const THREAD_SAFE: PoolFlags = PoolFlags(1 << 1);
    /// Maintain peak usage and allocation counters.
    pub const TRACK_STATS: PoolFlags = PoolFlags(1 << 2);

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: PoolFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PoolFlags {
    type Output = PoolFlags;

    fn bitor(self, rhs: PoolFlags) -> PoolFlags {
        PoolFlags(self.0 | rhs.0)
    }
}

/// Point-in-time snapshot of a pool's usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_size: usize,
    pub block_size: usize,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_size: usize,
    pub free_size: usize,
    pub peak_usage: usize,
    pub allocation_count: usize,
    pub deallocation_count: usize,
}

impl PoolStats {
    /// Fraction of the region currently issued, in percent.
    pub fn utilization_percent(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        (self.used_blocks as f64 / self.total_blocks as f64) * 100.0
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "blocks:{}/{},used:{}B,peak:{}B,allocs:{},frees:{}",
            self.used_blocks,
            self.total_blocks,
            self.used_size,
            self.peak_usage,
            self.allocation_count,
            self.deallocation_count
        )
    }
}

struct FreeList {
    head: BlockId,
    free_count: usize,
}

struct PoolInner {
    base: NonNull<u8>,
    region_layout: Layout,
    block_size: usize,
    total_blocks: usize,
    flags: PoolFlags,
    free: Mutex<FreeList>,
    peak_used: AtomicUsize,
    alloc_count: AtomicUsize,
    dealloc_count: AtomicUsize,
    /// Countdown of forced allocation failures, for failure-atomicity tests.
    fail_injections: AtomicU32,
}

// SAFETY: the region is exclusively owned by the pool, the free list is
// guarded by the mutex, and counters are atomic. Contents of issued blocks
// are owned by the allocating caller, which is responsible for its own
// synchronization (single-writer per tree).
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // SAFETY: base was obtained from alloc with this exact layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.region_layout) };
    }
}

/// A fixed-block slab allocator over one contiguous region.
///
/// Cloning shares the same region; the pool is deallocated when the last
/// clone drops.
#[derive(Clone)]
pub struct SlabPool {
    inner: Arc<PoolInner>,
}

impl SlabPool {
    /// Reserves a `pool_size`-byte region aligned to the cache line and
    /// partitions it into blocks of `block_size` (rounded up to the cache
    /// line), all initially free.
    ///
    /// Fails with `InvalidSize` when `block_size` is zero, `pool_size`
    /// lies outside `[MIN_POOL_SIZE, MAX_POOL_SIZE]`, or the region cannot
    /// hold a single block; with `MemoryAllocation` when the region itself
    /// cannot be reserved.
    pub fn create(block_size: usize, pool_size: usize, flags: PoolFlags) -> Result<SlabPool> {
        tree_ensure!(block_size > 0, TreeError::InvalidSize);
        tree_ensure!(
            (MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&pool_size),
            TreeError::InvalidSize
        );

        let block_size = align_up(block_size, POOL_ALIGNMENT);
        let total_blocks = pool_size / block_size;
        tree_ensure!(total_blocks >= 1, TreeError::InvalidSize);

        let region_layout = match Layout::from_size_align(pool_size, POOL_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => tree_bail!(TreeError::InvalidSize),
        };
        // SAFETY: the layout has non-zero size (pool_size >= MIN_POOL_SIZE).
        let base = unsafe { alloc::alloc(region_layout) };
        let Some(base) = NonNull::new(base) else {
            tree_bail!(TreeError::MemoryAllocation);
        };

        let inner = PoolInner {
            base,
            region_layout,
            block_size,
            total_blocks,
            flags,
            free: Mutex::new(FreeList {
                head: NIL_BLOCK,
                free_count: 0,
            }),
            peak_used: AtomicUsize::new(0),
            alloc_count: AtomicUsize::new(0),
            dealloc_count: AtomicUsize::new(0),
            fail_injections: AtomicU32::new(0),
        };
        let pool = SlabPool {
            inner: Arc::new(inner),
        };
        pool.thread_free_chain();
        Ok(pool)
    }

    /// Rebuilds the free chain over the whole region: block i links to
    /// block i + 1, the last block terminates the chain.
    fn thread_free_chain(&self) {
        let inner = &*self.inner;
        let mut free = inner.free.lock();
        for i in 0..inner.total_blocks {
            let next = if i + 1 < inner.total_blocks {
                (i + 1) as BlockId
            } else {
                NIL_BLOCK
            };
            // SAFETY: block i lies inside the region and is at least 64
            // bytes, so the 4-byte link write is in bounds and aligned.
            unsafe { self.block_ptr_raw(i as BlockId).cast::<BlockId>().write(next) };
        }
        free.head = 0;
        free.free_count = inner.total_blocks;
    }

    fn block_ptr_raw(&self, id: BlockId) -> *mut u8 {
        debug_assert!((id as usize) < self.inner.total_blocks);
        // SAFETY: id is a valid block index, so the offset stays inside
        // the region.
        unsafe { self.inner.base.as_ptr().add(id as usize * self.inner.block_size) }
    }

    /// Address of the given block. The block need not be allocated; the
    /// caller owns the contents of blocks it allocated and must not touch
    /// others.
    #[inline]
    pub fn block_ptr(&self, id: BlockId) -> NonNull<u8> {
        // SAFETY: base is non-null and the offset stays inside the region.
        unsafe { NonNull::new_unchecked(self.block_ptr_raw(id)) }
    }

    /// Pops a free block in O(1). Returns `None` when the pool is
    /// exhausted (or a failure was injected).
    pub fn alloc_block(&self) -> Option<BlockId> {
        let inner = &*self.inner;

        let mut injected = inner.fail_injections.load(Ordering::Acquire);
        while injected > 0 {
            match inner.fail_injections.compare_exchange_weak(
                injected,
                injected - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return None,
                Err(observed) => injected = observed,
            }
        }

        let id = {
            let mut free = inner.free.lock();
            if free.head == NIL_BLOCK {
                return None;
            }
            let id = free.head;
            // SAFETY: head is a valid free block whose first four bytes
            // hold the next link.
            free.head = unsafe { self.block_ptr_raw(id).cast::<BlockId>().read() };
            free.free_count -= 1;
            if inner.flags.contains(PoolFlags::TRACK_STATS) {
                let used = (inner.total_blocks - free.free_count) * inner.block_size;
                inner.peak_used.fetch_max(used, Ordering::AcqRel);
                inner.alloc_count.fetch_add(1, Ordering::Relaxed);
            }
            id
        };

        if inner.flags.contains(PoolFlags::ZERO_MEMORY) {
            // SAFETY: the block was just popped, so no other holder exists.
            unsafe { self.block_ptr_raw(id).write_bytes(0, inner.block_size) };
        }
        Some(id)
    }

    /// Pushes a block back in O(1). An id out of range, or a push beyond
    /// the region's capacity, is ignored.
    pub fn free_block(&self, id: BlockId) {
        let inner = &*self.inner;
        if (id as usize) >= inner.total_blocks {
            return;
        }
        let mut free = inner.free.lock();
        if free.free_count >= inner.total_blocks {
            return;
        }
        // SAFETY: the caller relinquishes the block; writing the link into
        // its first four bytes is in bounds.
        unsafe { self.block_ptr_raw(id).cast::<BlockId>().write(free.head) };
        free.head = id;
        free.free_count += 1;
        if inner.flags.contains(PoolFlags::TRACK_STATS) {
            inner.dealloc_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases by address. Pointers outside the region, or not on a block
    /// boundary, are ignored.
    pub fn free_ptr(&self, ptr: *mut u8) {
        if let Some(id) = self.id_of(ptr as *const u8) {
            self.free_block(id);
        }
    }

    /// O(1) test of whether an address lies inside the pool region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.inner.base.as_ptr() as usize;
        let end = base + self.inner.total_blocks * self.inner.block_size;
        (base..end).contains(&(ptr as usize))
    }

    /// Maps an address to its block id. `None` for addresses outside the
    /// region or not on a block boundary.
    pub fn id_of(&self, ptr: *const u8) -> Option<BlockId> {
        if !self.contains(ptr) {
            return None;
        }
        let offset = ptr as usize - self.inner.base.as_ptr() as usize;
        if offset % self.inner.block_size != 0 {
            return None;
        }
        Some((offset / self.inner.block_size) as BlockId)
    }

    /// Returns every block to the free list. O(n) in the block count.
    ///
    /// Any outstanding block handles become dangling; callers must drop
    /// their references first.
    pub fn reset(&self) {
        self.thread_free_chain();
    }

    /// Rounded block size actually in effect.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Number of blocks the region was partitioned into.
    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.inner.total_blocks
    }

    /// Number of blocks currently issued.
    pub fn used_blocks(&self) -> usize {
        self.inner.total_blocks - self.inner.free.lock().free_count
    }

    /// Flags the pool was created with.
    pub fn flags(&self) -> PoolFlags {
        self.inner.flags
    }

    /// Snapshot of usage counters. Peak and allocation counters are zero
    /// unless the pool was created with `TRACK_STATS`.
    pub fn stats(&self) -> PoolStats {
        let inner = &*self.inner;
        let free_count = inner.free.lock().free_count;
        let used_blocks = inner.total_blocks - free_count;
        PoolStats {
            total_size: inner.total_blocks * inner.block_size,
            block_size: inner.block_size,
            total_blocks: inner.total_blocks,
            used_blocks,
            free_blocks: free_count,
            used_size: used_blocks * inner.block_size,
            free_size: free_count * inner.block_size,
            peak_usage: inner.peak_used.load(Ordering::Acquire),
            allocation_count: inner.alloc_count.load(Ordering::Relaxed),
            deallocation_count: inner.dealloc_count.load(Ordering::Relaxed),
        }
    }

    /// Forces the next `n` calls to [`alloc_block`](Self::alloc_block) to
    /// fail, exercising the engine's failure-atomicity paths.
    pub fn inject_alloc_failures(&self, n: u32) {
        self.inner.fail_injections.store(n, Ordering::Release);
    }

    /// Cancels any pending injected failures.
    pub fn clear_alloc_failures(&self) {
        self.inner.fail_injections.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabPool")
            .field("block_size", &self.inner.block_size)
            .field("total_blocks", &self.inner.total_blocks)
            .field("used_blocks", &self.used_blocks())
            .finish()
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
