//! # Memory Subsystem
//!
//! This module supplies fixed-size, cache-aligned blocks for tree nodes and
//! routes irregular allocations to the system heap.
//!
//! ## Architecture
//!
//! ```text
//! +----------------------------------------------------------+
//! |                     MemoryManager                        |
//! |  size-classed pool registry + heap fallback (> 64 KiB)   |
//! +----------------------------------------------------------+
//!        │ pool_for(block_size)
//!        v
//! +----------------------------------------------------------+
//! |                       SlabPool                           |
//! |  one contiguous region, fixed blocks, intrusive free     |
//! |  list, O(1) alloc/free, O(1) contains                    |
//! +----------------------------------------------------------+
//!        │ BlockId
//!        v
//!   tree nodes (one block per node, addressed by index)
//! ```
//!
//! A pool may be shared by several trees; the free list is guarded and
//! every block is owned by exactly one tree at a time. Block handles are
//! indices rather than pointers, which keeps the ownership graph acyclic:
//! the pool owns the memory, nodes refer to each other by id.

mod manager;
mod pool;

pub use manager::{ManagerStats, MemoryManager};
pub use pool::{BlockId, PoolFlags, PoolStats, SlabPool, NIL_BLOCK};

pub(crate) use pool::align_up;
