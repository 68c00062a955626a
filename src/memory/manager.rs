//! # Memory Manager
//!
//! Routes allocation requests to size-classed slab pools, falling back to
//! the system heap for requests too large to pool. Trees normally obtain a
//! shared node pool through [`MemoryManager::pool_for`]; the raw
//! `alloc`/`free` surface serves callers with irregular sizes.
//!
//! ## Routing
//!
//! ```text
//! alloc(size)
//!   │
//!   ├─ size > LARGE_ALLOC_THRESHOLD (64 KiB)
//!   │     └─> system heap, with per-pointer layout bookkeeping so the
//!   │         matching free dispatches correctly
//!   │
//!   └─ otherwise
//!         └─> first pool whose block size covers the request; when none
//!             fits and fewer than MAX_POOLS exist, a new pool is created
//!             with the block size rounded up to the next power of two
//! ```
//!
//! ## Accounting
//!
//! Four global counters (total allocated, total freed, current usage, peak
//! usage) are maintained with atomics. Pool-served requests account the
//! full block size, heap-served requests the requested size.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::{
    DEFAULT_POOL_SIZE, LARGE_ALLOC_THRESHOLD, MAX_POOLS, MAX_POOL_SIZE, POOL_ALIGNMENT,
};
use crate::error::TreeError;
use crate::memory::pool::{align_up, PoolFlags, SlabPool};

static GLOBAL_MANAGER: OnceLock<MemoryManager> = OnceLock::new();

/// Snapshot of the manager's global counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub total_allocated: usize,
    pub total_freed: usize,
    pub current_usage: usize,
    pub peak_usage: usize,
    pub pool_count: usize,
}

impl std::fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pools:{},current:{}B,peak:{}B,allocated:{}B,freed:{}B",
            self.pool_count,
            self.current_usage,
            self.peak_usage,
            self.total_allocated,
            self.total_freed
        )
    }
}

/// Size-classed pool registry with a heap fallback for large requests.
pub struct MemoryManager {
    pools: Mutex<Vec<SlabPool>>,
    large: Mutex<HashMap<usize, Layout>>,
    total_allocated: AtomicUsize,
    total_freed: AtomicUsize,
    current_usage: AtomicUsize,
    peak_usage: AtomicUsize,
}

impl MemoryManager {
    /// Creates an empty manager; pools appear on demand.
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(Vec::new()),
            large: Mutex::new(HashMap::new()),
            total_allocated: AtomicUsize::new(0),
            total_freed: AtomicUsize::new(0),
            current_usage: AtomicUsize::new(0),
            peak_usage: AtomicUsize::new(0),
        }
    }

    /// The process-wide manager used by tree constructors that do not
    /// bring their own pool.
    pub fn global() -> &'static MemoryManager {
        GLOBAL_MANAGER.get_or_init(MemoryManager::new)
    }

    /// Allocates `size` bytes. Returns `None` for zero-size requests or
    /// when no route can serve the request.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        if size > LARGE_ALLOC_THRESHOLD {
            return self.alloc_large(size);
        }

        {
            let pools = self.pools.lock();
            for pool in pools.iter() {
                if pool.block_size() >= size {
                    if let Some(id) = pool.alloc_block() {
                        self.account_alloc(pool.block_size());
                        return Some(pool.block_ptr(id));
                    }
                }
            }
        }

        match self.create_pool(size) {
            Ok(pool) => {
                let id = pool.alloc_block()?;
                self.account_alloc(pool.block_size());
                Some(pool.block_ptr(id))
            }
            // All size classes occupied: serve from the heap like an
            // oversized request.
            Err(_) => self.alloc_large(size),
        }
    }

    /// Releases a pointer previously returned by [`alloc`](Self::alloc).
    /// Unknown pointers are ignored.
    pub fn free(&self, ptr: NonNull<u8>) {
        {
            let pools = self.pools.lock();
            for pool in pools.iter() {
                if pool.contains(ptr.as_ptr()) {
                    pool.free_ptr(ptr.as_ptr());
                    self.account_free(pool.block_size());
                    return;
                }
            }
        }

        let layout = self.large.lock().remove(&(ptr.as_ptr() as usize));
        if let Some(layout) = layout {
            // SAFETY: the pointer was produced by alloc_large with this
            // exact layout and removed from the table exactly once.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            self.account_free(layout.size());
        }
    }

    /// Hands out a shared pool whose blocks cover `block_size` bytes,
    /// creating the size class on first use.
    ///
    /// Fails with `InvalidSize` when no legal pool can hold such blocks
    /// and with `MemoryAllocation` when every size-class slot is taken.
    pub fn pool_for(&self, block_size: usize) -> Result<SlabPool> {
        tree_ensure!(block_size > 0, TreeError::InvalidSize);
        tree_ensure!(block_size <= MAX_POOL_SIZE, TreeError::InvalidSize);

        {
            let pools = self.pools.lock();
            if let Some(pool) = pools.iter().find(|p| p.block_size() >= block_size) {
                return Ok(pool.clone());
            }
        }
        self.create_pool(block_size)
    }

    fn create_pool(&self, block_size: usize) -> Result<SlabPool> {
        let class_size = align_up(block_size, POOL_ALIGNMENT).next_power_of_two();
        // Size each class to thousands of blocks so several trees can
        // share it, within the legal pool range.
        let pool_size = class_size
            .saturating_mul(8192)
            .clamp(DEFAULT_POOL_SIZE, MAX_POOL_SIZE);
        tree_ensure!(class_size <= pool_size, TreeError::InvalidSize);

        let mut pools = self.pools.lock();
        // Another caller may have raced the same size class in.
        if let Some(pool) = pools.iter().find(|p| p.block_size() >= block_size) {
            return Ok(pool.clone());
        }
        tree_ensure!(pools.len() < MAX_POOLS, TreeError::MemoryAllocation);

        let pool = SlabPool::create(
            class_size,
            pool_size,
            PoolFlags::THREAD_SAFE | PoolFlags::TRACK_STATS,
        )?;
        pools.push(pool.clone());
        Ok(pool)
    }

    fn alloc_large(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, POOL_ALIGNMENT).ok()?;
        // SAFETY: the layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.large.lock().insert(ptr.as_ptr() as usize, layout);
        self.account_alloc(size);
        Some(ptr)
    }

    fn account_alloc(&self, bytes: usize) {
        self.total_allocated.fetch_add(bytes, Ordering::Relaxed);
        let current = self.current_usage.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak_usage.fetch_max(current, Ordering::AcqRel);
    }

    fn account_free(&self, bytes: usize) {
        self.total_freed.fetch_add(bytes, Ordering::Relaxed);
        self.current_usage.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Snapshot of the global counters.
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            current_usage: self.current_usage.load(Ordering::Acquire),
            peak_usage: self.peak_usage.load(Ordering::Acquire),
            pool_count: self.pools.lock().len(),
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_come_from_a_pool() {
        let manager = MemoryManager::new();

        let ptr = manager.alloc(128).unwrap();
        assert_eq!(manager.stats().pool_count, 1);

        let pools = manager.pools.lock();
        assert!(pools[0].contains(ptr.as_ptr()));
    }

    #[test]
    fn same_class_reuses_the_pool() {
        let manager = MemoryManager::new();

        let a = manager.alloc(100).unwrap();
        let b = manager.alloc(120).unwrap();
        assert_eq!(manager.stats().pool_count, 1);

        manager.free(a);
        manager.free(b);
        assert_eq!(manager.stats().current_usage, 0);
    }

    #[test]
    fn large_allocations_route_to_the_heap() {
        let manager = MemoryManager::new();
        let size = LARGE_ALLOC_THRESHOLD + 1;

        let ptr = manager.alloc(size).unwrap();
        assert_eq!(manager.stats().pool_count, 0);
        assert_eq!(manager.stats().current_usage, size);

        manager.free(ptr);
        assert_eq!(manager.stats().current_usage, 0);
        assert_eq!(manager.stats().total_freed, size);
    }

    #[test]
    fn zero_size_alloc_returns_none() {
        let manager = MemoryManager::new();
        assert!(manager.alloc(0).is_none());
    }

    #[test]
    fn unknown_pointer_free_is_ignored() {
        let manager = MemoryManager::new();
        let mut local = [0u8; 8];

        manager.free(NonNull::new(local.as_mut_ptr()).unwrap());
        assert_eq!(manager.stats().total_freed, 0);
    }

    #[test]
    fn pool_for_shares_a_size_class() {
        let manager = MemoryManager::new();

        let a = manager.pool_for(1024).unwrap();
        let b = manager.pool_for(900).unwrap();
        assert_eq!(a.block_size(), b.block_size());
        assert_eq!(manager.stats().pool_count, 1);
    }

    #[test]
    fn pool_for_rejects_impossible_blocks() {
        let manager = MemoryManager::new();
        assert!(manager.pool_for(MAX_POOL_SIZE + 1).is_err());
        assert!(manager.pool_for(0).is_err());
    }

    #[test]
    fn peak_usage_is_monotonic() {
        let manager = MemoryManager::new();

        let a = manager.alloc(256).unwrap();
        let peak = manager.stats().peak_usage;
        manager.free(a);

        assert_eq!(manager.stats().peak_usage, peak);
        assert!(peak > 0);
    }
}
