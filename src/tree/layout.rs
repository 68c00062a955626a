//! # Node Block Layout
//!
//! Every tree node occupies exactly one slab block. This module computes
//! where the header, key run, value run, and child-id run live inside the
//! block for a given degree and capability, so the node views can do plain
//! pointer arithmetic.
//!
//! ## Block Layout
//!
//! ```text
//! +-------------------+ 0
//! | NodeHeader (8B)   |  leaf flag, num_keys, parent id
//! +-------------------+ keys_off (aligned to the key type)
//! | K[0] .. K[cap-1]  |  cap = 2·t − 1, fixed at creation
//! +-------------------+ values_off (aligned to the value type)
//! | V[0] .. V[cap-1]  |
//! +-------------------+ children_off (aligned to 4)
//! | C[0] .. C[cap]    |  BlockId per child; one more slot than keys
//! +-------------------+ block_size (rounded up to the cache line)
//! ```
//!
//! The child run is reserved in every block, leaf or internal, so all
//! blocks of a tree are interchangeable and a single pool size class
//! serves the whole tree. Only the first `num_keys` keys/values and, for
//! internal nodes, the first `num_keys + 1` child slots are initialized.
//!
//! ## Alignment
//!
//! Pool blocks start on a cache line (64 bytes) and block sizes are
//! multiples of 64, so any payload alignment up to 64 is satisfied by
//! aligning the in-block offsets alone. Payloads with stricter alignment
//! are rejected at construction with `AlignmentError`.

use eyre::Result;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::caps::TypeCaps;
use crate::config::{MAX_DEGREE, MIN_DEGREE, POOL_ALIGNMENT};
use crate::error::TreeError;
use crate::memory::align_up;

/// Byte size of [`NodeHeader`].
pub(crate) const HEADER_SIZE: usize = 8;

/// Fixed header at the front of every node block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct NodeHeader {
    /// 1 for leaves, 0 for internal nodes.
    pub leaf: u16,
    /// Number of initialized key/value slots, in `[0, max_keys]`.
    pub num_keys: u16,
    /// Parent block id; `NIL_BLOCK` at the root.
    pub parent: u32,
}

/// Precomputed in-block offsets for one tree's nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeLayout {
    degree: usize,
    max_keys: usize,
    key_size: usize,
    value_size: usize,
    keys_off: usize,
    values_off: usize,
    children_off: usize,
    block_size: usize,
}

impl NodeLayout {
    /// Validates the degree and capability, then computes the offsets.
    pub fn new(degree: usize, caps: &TypeCaps) -> Result<NodeLayout> {
        tree_ensure!(
            (MIN_DEGREE..=MAX_DEGREE).contains(&degree),
            TreeError::InvalidDegree(degree)
        );
        tree_ensure!(caps.key().size() > 0, TreeError::InvalidSize);
        tree_ensure!(caps.value().size() > 0, TreeError::InvalidSize);
        for align in [caps.key().align(), caps.value().align()] {
            tree_ensure!(
                align.is_power_of_two() && align <= POOL_ALIGNMENT,
                TreeError::AlignmentError(align)
            );
        }

        let max_keys = 2 * degree - 1;
        let keys_off = align_up(HEADER_SIZE, caps.key().align());
        let values_off = align_up(keys_off + max_keys * caps.key().size(), caps.value().align());
        let children_off = align_up(
            values_off + max_keys * caps.value().size(),
            std::mem::align_of::<u32>(),
        );
        let block_size = align_up(
            children_off + (max_keys + 1) * std::mem::size_of::<u32>(),
            POOL_ALIGNMENT,
        );

        Ok(NodeLayout {
            degree,
            max_keys,
            key_size: caps.key().size(),
            value_size: caps.value().size(),
            keys_off,
            values_off,
            children_off,
            block_size,
        })
    }

    #[inline]
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// `2·t − 1`: capacity of every node.
    #[inline]
    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// `t − 1`: occupancy floor for non-root nodes.
    #[inline]
    pub fn min_keys(&self) -> usize {
        self.degree - 1
    }

    #[inline]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    #[inline]
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    #[inline]
    pub fn keys_off(&self) -> usize {
        self.keys_off
    }

    #[inline]
    pub fn values_off(&self) -> usize {
        self.values_off
    }

    #[inline]
    pub fn children_off(&self) -> usize {
        self.children_off
    }

    /// Total block size a pool must provide, a multiple of the cache line.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
