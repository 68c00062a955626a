//! # Configuration Constants
//!
//! This module centralizes all configuration constants, grouping
//! interdependent values together and documenting their relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! CACHE_LINE_SIZE (64 bytes)
//!       │
//!       ├─> POOL_ALIGNMENT (pool regions and block sizes round up to it,
//!       │     so every block starts cache-line aligned and any payload
//!       │     alignment up to 64 is satisfied for free)
//!       │
//!       └─> Node block sizes (always a multiple, see tree::layout)
//!
//! MIN_DEGREE (3) .. MAX_DEGREE (1024)
//!       │
//!       └─> max_keys = 2·t − 1, min_keys = t − 1, max_children = 2·t
//!             max_keys for MAX_DEGREE is 2047, which fits the u16
//!             num_keys field of the node header.
//!
//! MIN_POOL_SIZE (64 KiB) .. MAX_POOL_SIZE (64 MiB)
//!       │
//!       ├─> DEFAULT_POOL_SIZE (1 MiB) must lie inside the range
//!       │
//!       └─> LARGE_ALLOC_THRESHOLD (64 KiB): manager requests above this
//!             bypass the pools and go to the system heap, so no pool is
//!             ever asked for a block bigger than the smallest legal pool
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions below:
//!
//! 1. `MIN_DEGREE >= 3` (a node must be splittable into two legal halves)
//! 2. `MIN_POOL_SIZE <= DEFAULT_POOL_SIZE <= MAX_POOL_SIZE`
//! 3. `POOL_ALIGNMENT` is a power of two
//! 4. `2 * MAX_DEGREE - 1 <= u16::MAX` (num_keys fits the node header)

// ============================================================================
// DEGREE CONFIGURATION
// ============================================================================

/// Smallest accepted branching factor. Below 3 a full node cannot be split
/// into two nodes that both satisfy the minimum occupancy rule.
pub const MIN_DEGREE: usize = 3;

/// Largest accepted branching factor.
pub const MAX_DEGREE: usize = 1024;

/// Degree used when the caller does not specify one.
pub const DEFAULT_DEGREE: usize = 16;

// ============================================================================
// MEMORY LAYOUT CONFIGURATION
// These constants are tightly coupled - changing one may require changing
// the others
// ============================================================================

/// Cache line size assumed for block alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Alignment of pool regions and granularity of block sizes. Equal to the
/// cache line size so consecutive blocks never share a line.
pub const POOL_ALIGNMENT: usize = CACHE_LINE_SIZE;

/// Smallest legal pool region.
pub const MIN_POOL_SIZE: usize = 64 * 1024;

/// Largest legal pool region.
pub const MAX_POOL_SIZE: usize = 64 * 1024 * 1024;

/// Region size for pools the manager creates on demand.
pub const DEFAULT_POOL_SIZE: usize = 1024 * 1024;

/// Maximum number of size-classed pools the manager keeps.
pub const MAX_POOLS: usize = 8;

/// Requests above this size bypass the pools and route to the system heap.
pub const LARGE_ALLOC_THRESHOLD: usize = 64 * 1024;

// ============================================================================
// COMPILE-TIME ASSERTIONS
// ============================================================================

const _: () = assert!(MIN_DEGREE >= 3);
const _: () = assert!(MIN_DEGREE < MAX_DEGREE);
const _: () = assert!(DEFAULT_DEGREE >= MIN_DEGREE && DEFAULT_DEGREE <= MAX_DEGREE);
const _: () = assert!(POOL_ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_POOL_SIZE <= DEFAULT_POOL_SIZE);
const _: () = assert!(DEFAULT_POOL_SIZE <= MAX_POOL_SIZE);
const _: () = assert!(LARGE_ALLOC_THRESHOLD <= MIN_POOL_SIZE);
const _: () = assert!(2 * MAX_DEGREE - 1 <= u16::MAX as usize);
