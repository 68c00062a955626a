//! # Tree Engine
//!
//! The type-erased B-Tree engine. It owns the root reference and the
//! per-tree counters, draws node blocks from a slab pool, and manipulates
//! payloads exclusively through the capability it was built with.
//!
//! ## Structure
//!
//! A classic B-Tree of degree `t`: every node, leaf or internal, carries
//! up to `2·t − 1` key/value pairs; internal nodes carry one more child
//! than keys. All leaves sit at the same depth and every non-root node
//! holds at least `t − 1` keys.
//!
//! ## Insert Algorithm
//!
//! ```text
//! 1. Reject duplicates up front (unless the tree allows them), so a
//!    failed insert never touches the tree
//! 2. Walk the search path read-only, counting the full nodes on it, and
//!    reserve exactly that many blocks from the pool; after this point
//!    the mutation phase cannot fail
//! 3. If the root is full, grow a new root and split the old one into it
//! 4. Descend; split every full child before entering it, so the parent
//!    of the final leaf always has room for a promoted separator
//! 5. Insert at the leaf gap
//! ```
//!
//! ## Delete Algorithm
//!
//! ```text
//! 1. Reject absent keys up front, so a failed delete never touches the
//!    tree
//! 2. Descend; before entering any child holding only t − 1 keys, refill
//!    it to t by rotating a key through the parent separator or merging
//!    it with a sibling
//! 3. A key found in an internal node is replaced by its in-order
//!    predecessor (or successor) extracted from the taller neighbour, or
//!    the two children are merged around it and the walk continues
//! 4. A key found in a leaf is destroyed in place
//! 5. A root emptied by a merge is demoted: its sole child becomes the
//!    new root and the height shrinks by one
//! ```
//!
//! Both walks touch O(height) nodes. Splits are the only allocation on
//! the insert path, merges the only release on the delete path.
//!
//! ## Move Discipline
//!
//! Separators promoted by splits, rotated through parents, or pulled down
//! by merges are moved, never copied, so the payload destructor runs
//! exactly once per logical removal: at `remove_at` in a leaf, at
//! separator replacement, or at [`clear`](RawTree::clear).
//!
//! ## Thread Safety
//!
//! One writer, no concurrent readers: mutators take `&mut self` and no
//! operation yields. A pool may be shared between trees; each block is
//! owned by exactly one tree at a time.

use std::cmp::Ordering;
use std::ptr::NonNull;

use eyre::Result;
use smallvec::SmallVec;

use crate::caps::TypeCaps;
use crate::error::TreeError;
use crate::memory::{BlockId, SlabPool, NIL_BLOCK};
use crate::tree::iter::RawCursor;
use crate::tree::layout::NodeLayout;
use crate::tree::node::{NodeMut, NodeRef, SearchResult};

/// Tree configuration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeFlags(u32);

impl TreeFlags {
    /// No flags set.
    pub const NONE: TreeFlags = TreeFlags(0);
    /// Equal keys may coexist; insertion breaks ties to the left.
    pub const ALLOW_DUPLICATES: TreeFlags = TreeFlags(1);
    /// Reserved; accepted and recorded, not yet honored.
    pub const THREAD_SAFE: TreeFlags = TreeFlags(1 << 1);
    /// Reserved; accepted and recorded, not yet honored.
    pub const CASE_INSENSITIVE: TreeFlags = TreeFlags(1 << 2);

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: TreeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TreeFlags {
    type Output = TreeFlags;

    fn bitor(self, rhs: TreeFlags) -> TreeFlags {
        TreeFlags(self.0 | rhs.0)
    }
}

/// Point-in-time snapshot of a tree's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub key_count: usize,
    pub node_count: usize,
    pub height: usize,
    pub degree: usize,
    pub memory_bytes: usize,
}

impl std::fmt::Display for TreeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "keys:{},nodes:{},height:{},degree:{},memory:{}B",
            self.key_count, self.node_count, self.height, self.degree, self.memory_bytes
        )
    }
}

/// The type-erased engine. Payload pointers cross this boundary raw; the
/// typed [`BTree`](crate::BTree) wrapper is the safe front-end.
pub struct RawTree {
    pool: SlabPool,
    layout: NodeLayout,
    caps: TypeCaps,
    flags: TreeFlags,
    root: Option<BlockId>,
    height: usize,
    key_count: usize,
    node_count: usize,
    epoch: u64,
    /// Staging slot for one key/value pair, used when a separator is
    /// replaced by its in-order neighbour during deletion.
    scratch: Vec<u8>,
}

impl RawTree {
    /// Creates an empty tree of the given degree over the given pool.
    ///
    /// Fails with `InvalidDegree`, `InvalidSize`, or `AlignmentError`
    /// when the degree or capability is unusable, and with `InvalidSize`
    /// when the pool's blocks are too small for this tree's nodes.
    pub fn new(degree: usize, caps: TypeCaps, pool: SlabPool) -> Result<RawTree> {
        let layout = NodeLayout::new(degree, &caps)?;
        tree_ensure!(
            pool.block_size() >= layout.block_size(),
            TreeError::InvalidSize
        );
        let scratch = vec![0u8; caps.key().size() + caps.value().size()];
        Ok(RawTree {
            pool,
            layout,
            caps,
            flags: TreeFlags::NONE,
            root: None,
            height: 0,
            key_count: 0,
            node_count: 0,
            epoch: 0,
            scratch,
        })
    }

    /// Sets the configuration flags. Only meaningful before the first
    /// insert.
    pub fn set_flags(&mut self, flags: TreeFlags) {
        self.flags = flags;
    }

    #[inline]
    pub fn flags(&self) -> TreeFlags {
        self.flags
    }

    #[inline]
    pub fn degree(&self) -> usize {
        self.layout.degree()
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The pool this tree draws node blocks from.
    pub fn pool(&self) -> &SlabPool {
        &self.pool
    }

    /// The capability this tree was built with.
    pub fn caps(&self) -> &TypeCaps {
        &self.caps
    }

    pub(crate) fn root_id(&self) -> Option<BlockId> {
        self.root
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TreeStats {
        TreeStats {
            key_count: self.key_count,
            node_count: self.node_count,
            height: self.height,
            degree: self.layout.degree(),
            memory_bytes: std::mem::size_of::<RawTree>()
                + self.node_count * self.layout.block_size(),
        }
    }

    // ========================================================================
    // Node access
    // ========================================================================

    pub(crate) fn node(&self, id: BlockId) -> NodeRef<'_> {
        // SAFETY: ids handed out by alloc_node stay valid until free_node;
        // the engine never holds a mutable view while shared views exist.
        unsafe { NodeRef::new(self.pool.block_ptr(id), &self.layout) }
    }

    fn node_mut(&self, id: BlockId) -> NodeMut<'_> {
        // SAFETY: as for node(); additionally the engine materializes at
        // most one mutable view per block at a time.
        unsafe { NodeMut::new(self.pool.block_ptr(id), &self.layout) }
    }

    fn alloc_root_leaf(&mut self) -> Result<BlockId> {
        let Some(id) = self.pool.alloc_block() else {
            tree_bail!(TreeError::MemoryAllocation);
        };
        self.node_mut(id).init(true);
        self.node_count += 1;
        Ok(id)
    }

    /// Draws a block from the preflight reserve, which is sized to cover
    /// every split the descent can perform; the pop cannot fail on a
    /// well-formed path.
    fn alloc_node(&mut self, leaf: bool, reserve: &mut SmallVec<[BlockId; 8]>) -> BlockId {
        debug_assert!(!reserve.is_empty());
        let id = reserve.pop().unwrap_or(NIL_BLOCK);
        self.node_mut(id).init(leaf);
        self.node_count += 1;
        id
    }

    fn free_node(&mut self, id: BlockId) {
        self.pool.free_block(id);
        self.node_count -= 1;
    }

    fn check_caps(&self, caps: &TypeCaps) -> Result<()> {
        tree_ensure!(caps.token() == self.caps.token(), TreeError::TypeMismatch);
        Ok(())
    }

    /// Raw pointers into the staging slot. Taken up front by deletion
    /// helpers so the later node views only need shared borrows.
    fn scratch_ptrs(&mut self) -> (*mut u8, *mut u8) {
        let key = self.scratch.as_mut_ptr();
        // SAFETY: scratch was sized to key_size + value_size.
        let value = unsafe { key.add(self.caps.key().size()) };
        (key, value)
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Walks from the root to the slot holding `key`, if any. Visits at
    /// most `height` nodes.
    ///
    /// # Safety
    ///
    /// `key` must reference a live key of this tree's key type.
    pub(crate) unsafe fn find(&self, key: *const u8) -> Option<(BlockId, usize)> {
        let mut id = self.root?;
        loop {
            let node = self.node(id);
            match node.locate(key, &self.caps) {
                SearchResult::Found(i) => return Some((id, i)),
                SearchResult::NotFound(gap) => {
                    if node.is_leaf() {
                        return None;
                    }
                    id = node.child(gap);
                }
            }
        }
    }

    /// Point lookup. Returns a borrow of the value slot, valid until the
    /// next mutation.
    ///
    /// # Safety
    ///
    /// `key` must reference a live key of this tree's key type, described
    /// by `caps`.
    pub unsafe fn search(&self, caps: &TypeCaps, key: *const u8) -> Result<Option<NonNull<u8>>> {
        self.check_caps(caps)?;
        match self.find(key) {
            // SAFETY: slot pointers inside a live block are non-null.
            Some((id, i)) => Ok(Some(NonNull::new_unchecked(
                self.node(id).value_ptr(i) as *mut u8
            ))),
            None => Ok(None),
        }
    }

    /// Membership test.
    ///
    /// # Safety
    ///
    /// As for [`search`](Self::search).
    pub unsafe fn contains(&self, caps: &TypeCaps, key: *const u8) -> Result<bool> {
        self.check_caps(caps)?;
        Ok(self.find(key).is_some())
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Inserts one pair. On success ownership of both payloads moves into
    /// the tree; on any error the caller retains ownership and the tree
    /// is untouched.
    ///
    /// # Safety
    ///
    /// `key` and `value` must reference live payloads of this tree's
    /// types, described by `caps`.
    pub unsafe fn insert(&mut self, caps: &TypeCaps, key: *const u8, value: *const u8) -> Result<()> {
        self.check_caps(caps)?;
        if !self.flags.contains(TreeFlags::ALLOW_DUPLICATES) && self.find(key).is_some() {
            tree_bail!(TreeError::DuplicateKey);
        }
        let caps = self.caps.clone();

        let Some(mut node_id) = self.root else {
            let id = self.alloc_root_leaf()?;
            self.node_mut(id).insert_at(0, key, value, &caps);
            self.root = Some(id);
            self.height = 1;
            self.key_count = 1;
            self.epoch += 1;
            return Ok(());
        };

        // Reserve every block the descent could need before mutating
        // anything, so an exhausted pool leaves the tree in its pre-call
        // state. Without duplicates the rehearsal count is exact; with
        // them, equal keys can reroute the descent mid-split, so the
        // worst case (one split per level plus a root growth) is
        // reserved instead and leftovers go back below.
        let needed = if self.flags.contains(TreeFlags::ALLOW_DUPLICATES) {
            self.height + 1
        } else {
            self.count_insert_allocs(key, node_id)
        };
        let mut reserve: SmallVec<[BlockId; 8]> = SmallVec::new();
        for _ in 0..needed {
            match self.pool.alloc_block() {
                Some(block) => reserve.push(block),
                None => {
                    for block in reserve {
                        self.pool.free_block(block);
                    }
                    tree_bail!(TreeError::MemoryAllocation);
                }
            }
        }

        let max_keys = self.layout.max_keys();
        if self.node(node_id).num_keys() == max_keys {
            let new_root = self.alloc_node(false, &mut reserve);
            self.node_mut(new_root).set_child(0, node_id);
            self.node_mut(node_id).set_parent(new_root);
            self.split_child(new_root, 0, &mut reserve);
            self.root = Some(new_root);
            self.height += 1;
            node_id = new_root;
        }

        loop {
            let node = self.node(node_id);
            let pos = node.locate(key, &caps);
            if node.is_leaf() {
                let at = match pos {
                    SearchResult::Found(i) => i,
                    SearchResult::NotFound(gap) => gap,
                };
                self.node_mut(node_id).insert_at(at, key, value, &caps);
                break;
            }

            let mut idx = match pos {
                // Ties break left: an equal separator routes into the
                // left subtree.
                SearchResult::Found(i) => i,
                SearchResult::NotFound(gap) => gap,
            };
            let child_id = node.child(idx);
            if self.node(child_id).num_keys() == max_keys {
                self.split_child(node_id, idx, &mut reserve);
                let node = self.node(node_id);
                if self.caps.compare(key, node.key_ptr(idx)) == Ordering::Greater {
                    idx += 1;
                }
                node_id = node.child(idx);
            } else {
                node_id = child_id;
            }
        }

        for block in reserve {
            self.pool.free_block(block);
        }
        self.key_count += 1;
        self.epoch += 1;
        Ok(())
    }

    /// Read-only rehearsal of the insert descent: counts the full nodes
    /// on the search path (each costs one sibling) plus one extra block
    /// when the root itself is full. The split of an ancestor partitions
    /// its children without moving any grandchild, so the rehearsal and
    /// the real descent visit the same blocks.
    unsafe fn count_insert_allocs(&self, key: *const u8, root_id: BlockId) -> usize {
        let max_keys = self.layout.max_keys();
        let mut needed = 0;
        if self.node(root_id).num_keys() == max_keys {
            needed += 1;
        }
        let mut id = root_id;
        loop {
            let node = self.node(id);
            if node.num_keys() == max_keys {
                needed += 1;
            }
            if node.is_leaf() {
                return needed;
            }
            let idx = match node.locate(key, &self.caps) {
                SearchResult::Found(i) => i,
                SearchResult::NotFound(gap) => gap,
            };
            id = node.child(idx);
        }
    }

    /// Splits the full child at `idx` of `parent`: the upper half moves
    /// into a fresh sibling, the median pair is promoted into the parent
    /// at `idx`, and the sibling becomes child `idx + 1`.
    ///
    /// Precondition: the child holds `2·t − 1` keys and the parent has
    /// room for one more.
    fn split_child(&mut self, parent_id: BlockId, idx: usize, reserve: &mut SmallVec<[BlockId; 8]>) {
        let caps = self.caps.clone();
        let t = self.layout.degree();
        let child_id = self.node(parent_id).child(idx);
        let child_is_leaf = self.node(child_id).is_leaf();
        let sibling_id = self.alloc_node(child_is_leaf, reserve);

        // SAFETY: child, sibling, and parent are distinct live blocks of
        // this tree; payload moves stay inside their initialized runs.
        unsafe {
            let child = self.node(child_id);
            let mut sibling = self.node_mut(sibling_id);
            debug_assert_eq!(child.num_keys(), self.layout.max_keys());

            caps.key().copy_to(child.key_ptr(t), sibling.key_ptr_mut(0), t - 1);
            caps.value()
                .copy_to(child.value_ptr(t), sibling.value_ptr_mut(0), t - 1);
            if !child_is_leaf {
                for j in 0..t {
                    let grandchild = child.child(t + j);
                    sibling.set_child(j, grandchild);
                    self.node_mut(grandchild).set_parent(sibling_id);
                }
            }
            sibling.set_num_keys(t - 1);
            sibling.set_parent(parent_id);

            let mut parent = self.node_mut(parent_id);
            let parent_children = parent.num_keys() + 1;
            parent.insert_at(idx, child.key_ptr(t - 1), child.value_ptr(t - 1), &caps);
            parent.shift_children_right(idx + 1, parent_children);
            parent.set_child(idx + 1, sibling_id);

            self.node_mut(child_id).set_num_keys(t - 1);
        }
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Removes one pair, running payload destructors. Fails with
    /// `KeyNotFound` without touching the tree when the key is absent.
    ///
    /// # Safety
    ///
    /// `key` must reference a live key of this tree's key type, described
    /// by `caps`.
    pub unsafe fn delete(&mut self, caps: &TypeCaps, key: *const u8) -> Result<()> {
        self.check_caps(caps)?;
        if self.find(key).is_none() {
            tree_bail!(TreeError::KeyNotFound);
        }
        let caps = self.caps.clone();
        let t = self.layout.degree();
        // find() succeeded, so the root exists.
        let Some(mut node_id) = self.root else {
            tree_bail!(TreeError::KeyNotFound);
        };

        loop {
            let node = self.node(node_id);
            let pos = node.locate(key, &caps);

            if node.is_leaf() {
                match pos {
                    SearchResult::Found(i) => {
                        self.node_mut(node_id).remove_at(i, &caps);
                        if self.node(node_id).num_keys() == 0 {
                            // Only the root may empty; the tree is now
                            // empty as a whole.
                            debug_assert_eq!(Some(node_id), self.root);
                            self.free_node(node_id);
                            self.root = None;
                            self.height = 0;
                        }
                        break;
                    }
                    SearchResult::NotFound(_) => tree_bail!(TreeError::KeyNotFound),
                }
            }

            match pos {
                SearchResult::Found(i) => {
                    let left_id = node.child(i);
                    let right_id = node.child(i + 1);
                    if self.node(left_id).num_keys() >= t {
                        self.extract_edge(left_id, Edge::Rightmost);
                        self.replace_slot(node_id, i);
                        break;
                    } else if self.node(right_id).num_keys() >= t {
                        self.extract_edge(right_id, Edge::Leftmost);
                        self.replace_slot(node_id, i);
                        break;
                    } else {
                        let merged = self.merge_children(node_id, i);
                        node_id = self.demote_if_empty(node_id, merged);
                    }
                }
                SearchResult::NotFound(gap) => {
                    let child_id = node.child(gap);
                    if self.node(child_id).num_keys() < t {
                        let idx = self.fill_child(node_id, gap);
                        let target = self.node(node_id).child(idx);
                        node_id = self.demote_if_empty(node_id, target);
                    } else {
                        node_id = child_id;
                    }
                }
            }
        }

        self.key_count -= 1;
        self.epoch += 1;
        Ok(())
    }

    /// If `node_id` is the root and a merge just emptied it, installs
    /// `target` as the new root. Returns the node to continue the descent
    /// from.
    fn demote_if_empty(&mut self, node_id: BlockId, target: BlockId) -> BlockId {
        if Some(node_id) == self.root && self.node(node_id).num_keys() == 0 {
            self.free_node(node_id);
            self.root = Some(target);
            self.node_mut(target).set_parent(NIL_BLOCK);
            self.height -= 1;
        }
        target
    }

    /// Destroys the separator pair at `slot` and moves the staged
    /// in-order neighbour from the scratch buffer into its place.
    fn replace_slot(&mut self, node_id: BlockId, slot: usize) {
        let caps = self.caps.clone();
        let (scratch_key, scratch_value) = self.scratch_ptrs();
        let mut node = self.node_mut(node_id);
        // SAFETY: the slot holds a live pair; the scratch buffer holds
        // the pair staged by extract_edge, which is consumed here.
        unsafe {
            caps.key().drop_in_place(node.key_ptr_mut(slot), 1);
            caps.value().drop_in_place(node.value_ptr_mut(slot), 1);
            caps.key().copy_to(scratch_key, node.key_ptr_mut(slot), 1);
            caps.value().copy_to(scratch_value, node.value_ptr_mut(slot), 1);
        }
    }

    /// Walks to the rightmost (or leftmost) leaf of the subtree at `id`,
    /// refilling every child on the way, and moves that leaf's edge pair
    /// into the scratch buffer.
    ///
    /// Precondition: the subtree root holds at least `t` keys.
    fn extract_edge(&mut self, mut id: BlockId, edge: Edge) {
        let caps = self.caps.clone();
        let t = self.layout.degree();
        let (scratch_key, scratch_value) = self.scratch_ptrs();
        loop {
            let node = self.node(id);
            let nk = node.num_keys();
            if node.is_leaf() {
                let slot = match edge {
                    Edge::Rightmost => nk - 1,
                    Edge::Leftmost => 0,
                };
                let mut leaf = self.node_mut(id);
                // SAFETY: the slot pair moves into scratch; shift_out (or
                // the count decrement) retires the slot without a second
                // destructor run.
                unsafe {
                    caps.key().copy_to(leaf.key_ptr(slot), scratch_key, 1);
                    caps.value().copy_to(leaf.value_ptr(slot), scratch_value, 1);
                    match edge {
                        Edge::Rightmost => leaf.set_num_keys(nk - 1),
                        Edge::Leftmost => leaf.shift_out(0, &caps),
                    }
                }
                return;
            }

            let idx = match edge {
                Edge::Rightmost => nk,
                Edge::Leftmost => 0,
            };
            let child_id = node.child(idx);
            if self.node(child_id).num_keys() < t {
                let idx = self.fill_child(id, idx);
                id = self.node(id).child(idx);
            } else {
                id = child_id;
            }
        }
    }

    /// Refills the child at `idx`, which holds only `t − 1` keys, to at
    /// least `t`: rotate a key through the parent from a sibling holding
    /// `t` or more, otherwise merge with a sibling. Returns the child's
    /// index after the adjustment.
    fn fill_child(&mut self, parent_id: BlockId, idx: usize) -> usize {
        let t = self.layout.degree();
        let parent = self.node(parent_id);
        let parent_nk = parent.num_keys();

        if idx > 0 && self.node(parent.child(idx - 1)).num_keys() >= t {
            self.rotate_right(parent_id, idx - 1);
            idx
        } else if idx < parent_nk && self.node(parent.child(idx + 1)).num_keys() >= t {
            self.rotate_left(parent_id, idx);
            idx
        } else if idx > 0 {
            self.merge_children(parent_id, idx - 1);
            idx - 1
        } else {
            self.merge_children(parent_id, idx);
            idx
        }
    }

    /// Moves the separator at `sep` down to the front of its right child
    /// and the left sibling's last key up into the separator slot. The
    /// left sibling's last child crosses over along with its key.
    fn rotate_right(&mut self, parent_id: BlockId, sep: usize) {
        let caps = self.caps.clone();
        let parent = self.node(parent_id);
        let left_id = parent.child(sep);
        let target_id = parent.child(sep + 1);
        let left_nk = self.node(left_id).num_keys();

        // SAFETY: parent, left, and target are distinct live blocks; all
        // moves source initialized slots and land in reserved capacity.
        unsafe {
            let mut target = self.node_mut(target_id);
            let target_children = target.num_keys() + 1;
            target.insert_at(0, parent.key_ptr(sep), parent.value_ptr(sep), &caps);
            if !target.is_leaf() {
                let left = self.node(left_id);
                let moved = left.child(left_nk);
                target.shift_children_right(0, target_children);
                target.set_child(0, moved);
                self.node_mut(moved).set_parent(target_id);
            }

            let left = self.node(left_id);
            let mut parent = self.node_mut(parent_id);
            caps.key()
                .copy_to(left.key_ptr(left_nk - 1), parent.key_ptr_mut(sep), 1);
            caps.value()
                .copy_to(left.value_ptr(left_nk - 1), parent.value_ptr_mut(sep), 1);
            self.node_mut(left_id).set_num_keys(left_nk - 1);
        }
    }

    /// Mirror image of [`rotate_right`](Self::rotate_right): the
    /// separator at `sep` drops to the end of its left child and the
    /// right sibling's first key rises into the separator slot.
    fn rotate_left(&mut self, parent_id: BlockId, sep: usize) {
        let caps = self.caps.clone();
        let parent = self.node(parent_id);
        let target_id = parent.child(sep);
        let right_id = parent.child(sep + 1);
        let right_nk = self.node(right_id).num_keys();

        // SAFETY: as for rotate_right.
        unsafe {
            let mut target = self.node_mut(target_id);
            let target_nk = target.num_keys();
            target.insert_at(target_nk, parent.key_ptr(sep), parent.value_ptr(sep), &caps);
            if !target.is_leaf() {
                let right = self.node(right_id);
                let moved = right.child(0);
                target.set_child(target_nk + 1, moved);
                self.node_mut(moved).set_parent(target_id);
            }

            let right = self.node(right_id);
            let mut parent = self.node_mut(parent_id);
            caps.key().copy_to(right.key_ptr(0), parent.key_ptr_mut(sep), 1);
            caps.value()
                .copy_to(right.value_ptr(0), parent.value_ptr_mut(sep), 1);

            // Close the gap at the right sibling's front; its first child
            // crossed over, so the remaining children move down one slot.
            let mut right = self.node_mut(right_id);
            caps.key()
                .shift(right.key_ptr(1), right.key_ptr_mut(0), right_nk - 1);
            caps.value()
                .shift(right.value_ptr(1), right.value_ptr_mut(0), right_nk - 1);
            if !right.is_leaf() {
                right.shift_children_left(1, right_nk + 1);
            }
            right.set_num_keys(right_nk - 1);
        }
    }

    /// Fuses child `i`, the separator at `i`, and child `i + 1` into one
    /// node of `2·t − 1` keys, releases the right child's block, and
    /// returns the merged node's id.
    fn merge_children(&mut self, parent_id: BlockId, i: usize) -> BlockId {
        let caps = self.caps.clone();
        let parent = self.node(parent_id);
        let left_id = parent.child(i);
        let right_id = parent.child(i + 1);
        let left_nk = self.node(left_id).num_keys();
        let right_nk = self.node(right_id).num_keys();

        // SAFETY: parent, left, and right are distinct live blocks; the
        // separator and the right node's payloads move exactly once.
        unsafe {
            let mut left = self.node_mut(left_id);
            caps.key().copy_to(parent.key_ptr(i), left.key_ptr_mut(left_nk), 1);
            caps.value()
                .copy_to(parent.value_ptr(i), left.value_ptr_mut(left_nk), 1);

            let right = self.node(right_id);
            caps.key()
                .copy_to(right.key_ptr(0), left.key_ptr_mut(left_nk + 1), right_nk);
            caps.value()
                .copy_to(right.value_ptr(0), left.value_ptr_mut(left_nk + 1), right_nk);
            if !left.is_leaf() {
                for j in 0..=right_nk {
                    let grandchild = right.child(j);
                    left.set_child(left_nk + 1 + j, grandchild);
                    self.node_mut(grandchild).set_parent(left_id);
                }
            }
            left.set_num_keys(left_nk + 1 + right_nk);

            // The separator moved down, so the parent slot retires
            // without destructors; child i + 1 goes with it.
            self.node_mut(parent_id).shift_out(i, &caps);
        }
        self.free_node(right_id);
        left_id
    }

    // ========================================================================
    // Bulk load
    // ========================================================================

    /// Builds the tree bottom-up from `n` pre-sorted pairs laid out in
    /// two parallel arrays. On success ownership of every payload moves
    /// into the tree; on any error nothing was consumed.
    ///
    /// Fails with `InvalidOperation` when the tree is non-empty or the
    /// keys are not ascending, and with `DuplicateKey` when adjacent keys
    /// compare equal while duplicates are disallowed.
    ///
    /// # Safety
    ///
    /// `keys` and `values` must reference `n` live payloads of this
    /// tree's types, described by `caps`.
    pub unsafe fn bulk_load(
        &mut self,
        caps: &TypeCaps,
        keys: *const u8,
        values: *const u8,
        n: usize,
    ) -> Result<()> {
        self.check_caps(caps)?;
        tree_ensure!(
            self.root.is_none(),
            TreeError::InvalidOperation("bulk load requires an empty tree")
        );
        if n == 0 {
            return Ok(());
        }
        let caps = self.caps.clone();
        let key_size = caps.key().size();
        let value_size = caps.value().size();
        let allow_duplicates = self.flags.contains(TreeFlags::ALLOW_DUPLICATES);

        for i in 1..n {
            let prev = keys.add((i - 1) * key_size);
            let cur = keys.add(i * key_size);
            match caps.compare(prev, cur) {
                Ordering::Less => {}
                Ordering::Equal => {
                    tree_ensure!(allow_duplicates, TreeError::DuplicateKey);
                }
                Ordering::Greater => {
                    tree_bail!(TreeError::InvalidOperation("bulk load input is not sorted"))
                }
            }
        }

        // Plan every level before touching the pool or the payloads.
        let max_keys = self.layout.max_keys();
        let min_keys = self.layout.min_keys();
        let mut level_plans = vec![chunk_level(n, max_keys, min_keys)];
        loop {
            let children = level_plans[level_plans.len() - 1].len();
            if children == 1 {
                break;
            }
            level_plans.push(chunk_level(children - 1, max_keys, min_keys));
        }

        let total_nodes: usize = level_plans.iter().map(Vec::len).sum();
        let mut blocks: Vec<BlockId> = Vec::with_capacity(total_nodes);
        for _ in 0..total_nodes {
            match self.pool.alloc_block() {
                Some(block) => blocks.push(block),
                None => {
                    for block in blocks {
                        self.pool.free_block(block);
                    }
                    tree_bail!(TreeError::MemoryAllocation);
                }
            }
        }
        let mut blocks = blocks.into_iter();

        // Leaf level: runs of consecutive pairs, one pair skipped between
        // leaves as the separator for the level above.
        let mut cursor = 0usize;
        let mut level_nodes: Vec<BlockId> = Vec::with_capacity(level_plans[0].len());
        let mut seps: Vec<usize> = Vec::new();
        let leaf_plan = &level_plans[0];
        for (li, &fill) in leaf_plan.iter().enumerate() {
            let id = blocks.next().unwrap_or(NIL_BLOCK);
            let mut leaf = self.node_mut(id);
            leaf.init(true);
            caps.key()
                .copy_to(keys.add(cursor * key_size), leaf.key_ptr_mut(0), fill);
            caps.value()
                .copy_to(values.add(cursor * value_size), leaf.value_ptr_mut(0), fill);
            leaf.set_num_keys(fill);
            cursor += fill;
            if li + 1 < leaf_plan.len() {
                seps.push(cursor);
                cursor += 1;
            }
            level_nodes.push(id);
        }
        debug_assert_eq!(cursor, n);

        // Interior levels: each node takes a run of separators and one
        // more child than separators; one separator is skipped between
        // nodes for the next level up.
        for plan in &level_plans[1..] {
            let mut next_nodes: Vec<BlockId> = Vec::with_capacity(plan.len());
            let mut next_seps: Vec<usize> = Vec::new();
            let mut sep_iter = seps.iter().copied();
            let mut child_iter = level_nodes.iter().copied();
            for (ni, &fill) in plan.iter().enumerate() {
                let id = blocks.next().unwrap_or(NIL_BLOCK);
                let mut node = self.node_mut(id);
                node.init(false);
                for slot in 0..fill {
                    let pair = sep_iter.next().unwrap_or(0);
                    caps.key()
                        .copy_to(keys.add(pair * key_size), node.key_ptr_mut(slot), 1);
                    caps.value()
                        .copy_to(values.add(pair * value_size), node.value_ptr_mut(slot), 1);
                }
                node.set_num_keys(fill);
                for slot in 0..=fill {
                    let child = child_iter.next().unwrap_or(NIL_BLOCK);
                    node.set_child(slot, child);
                    self.node_mut(child).set_parent(id);
                }
                if ni + 1 < plan.len() {
                    next_seps.push(sep_iter.next().unwrap_or(0));
                }
                next_nodes.push(id);
            }
            level_nodes = next_nodes;
            seps = next_seps;
        }

        self.root = level_nodes.first().copied();
        self.height = level_plans.len();
        self.key_count = n;
        self.node_count = total_nodes;
        self.epoch += 1;
        Ok(())
    }

    // ========================================================================
    // Range search
    // ========================================================================

    /// Collects up to `max_results` pairs with `lo <= key <= hi`, in
    /// ascending order.
    ///
    /// # Safety
    ///
    /// `lo` and `hi` must reference live keys of this tree's key type,
    /// described by `caps`.
    pub unsafe fn range_search(
        &self,
        caps: &TypeCaps,
        lo: *const u8,
        hi: *const u8,
        max_results: usize,
    ) -> Result<Vec<(NonNull<u8>, NonNull<u8>)>> {
        self.check_caps(caps)?;
        let mut results = Vec::new();
        if self.caps.compare(lo, hi) == Ordering::Greater {
            return Ok(results);
        }
        let mut cursor = RawCursor::from_lower(self, lo, true);
        while results.len() < max_results {
            let Some((key, value)) = cursor.advance() else {
                break;
            };
            if self.caps.compare(key.as_ptr(), hi) == Ordering::Greater {
                break;
            }
            results.push((key, value));
        }
        Ok(results)
    }

    // ========================================================================
    // Clear
    // ========================================================================

    /// Releases every node in post-order, running payload destructors
    /// exactly once per pair. Infallible; the tree ends empty.
    pub fn clear(&mut self) {
        if let Some(root) = self.root.take() {
            self.release_subtree(root);
        }
        self.height = 0;
        self.key_count = 0;
        self.epoch += 1;
        debug_assert_eq!(self.node_count, 0);
    }

    fn release_subtree(&mut self, id: BlockId) {
        let caps = self.caps.clone();
        let nk = self.node(id).num_keys();
        if !self.node(id).is_leaf() {
            for j in 0..=nk {
                let child = self.node(id).child(j);
                self.release_subtree(child);
            }
        }
        let mut node = self.node_mut(id);
        // SAFETY: the first nk slots hold live payloads owned by this
        // tree; the block is released right after.
        unsafe {
            caps.key().drop_in_place(node.key_ptr_mut(0), nk);
            caps.value().drop_in_place(node.value_ptr_mut(0), nk);
        }
        self.free_node(id);
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Structural verifier: height balance, occupancy bounds, key
    /// ordering and separation, parent back-pointers, and the count
    /// identities. Returns `InvalidOperation` on the first violation.
    pub fn check_invariants(&self) -> Result<()> {
        let Some(root) = self.root else {
            tree_ensure!(
                self.height == 0 && self.key_count == 0 && self.node_count == 0,
                TreeError::InvalidOperation("empty tree has non-zero counters")
            );
            return Ok(());
        };
        tree_ensure!(
            self.node(root).num_keys() >= 1,
            TreeError::InvalidOperation("root holds no keys")
        );

        let mut seen_keys = 0usize;
        let mut seen_nodes = 0usize;
        self.check_subtree(root, NIL_BLOCK, 0, None, None, &mut seen_keys, &mut seen_nodes)?;
        tree_ensure!(
            seen_keys == self.key_count,
            TreeError::InvalidOperation("key count does not match reachable keys")
        );
        tree_ensure!(
            seen_nodes == self.node_count,
            TreeError::InvalidOperation("node count does not match reachable nodes")
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_subtree(
        &self,
        id: BlockId,
        expected_parent: BlockId,
        depth: usize,
        lo: Option<*const u8>,
        hi: Option<*const u8>,
        seen_keys: &mut usize,
        seen_nodes: &mut usize,
    ) -> Result<()> {
        let allow_duplicates = self.flags.contains(TreeFlags::ALLOW_DUPLICATES);
        let node = self.node(id);
        let nk = node.num_keys();

        tree_ensure!(
            node.parent() == expected_parent,
            TreeError::InvalidOperation("parent back-pointer disagrees with child slot")
        );
        if Some(id) != self.root {
            tree_ensure!(
                nk >= self.layout.min_keys(),
                TreeError::InvalidOperation("node below minimum occupancy")
            );
        }
        tree_ensure!(
            nk <= self.layout.max_keys(),
            TreeError::InvalidOperation("node above maximum occupancy")
        );

        let in_bounds = |key: *const u8| {
            // SAFETY: all probed slots hold live keys during a read-only
            // walk.
            unsafe {
                if let Some(lo) = lo {
                    let ord = self.caps.compare(key, lo);
                    if ord == Ordering::Less || (!allow_duplicates && ord == Ordering::Equal) {
                        return false;
                    }
                }
                if let Some(hi) = hi {
                    let ord = self.caps.compare(key, hi);
                    if ord == Ordering::Greater || (!allow_duplicates && ord == Ordering::Equal) {
                        return false;
                    }
                }
                true
            }
        };
        for i in 0..nk {
            tree_ensure!(
                in_bounds(node.key_ptr(i)),
                TreeError::InvalidOperation("key escapes its separator bounds")
            );
            if i + 1 < nk {
                // SAFETY: both slots hold live keys.
                let ord = unsafe { self.caps.compare(node.key_ptr(i), node.key_ptr(i + 1)) };
                let ordered = ord == Ordering::Less || (allow_duplicates && ord == Ordering::Equal);
                tree_ensure!(
                    ordered,
                    TreeError::InvalidOperation("keys out of order inside a node")
                );
            }
        }

        *seen_keys += nk;
        *seen_nodes += 1;

        if node.is_leaf() {
            tree_ensure!(
                depth + 1 == self.height,
                TreeError::InvalidOperation("leaf depth disagrees with height")
            );
            return Ok(());
        }
        for i in 0..=nk {
            let child_lo = if i == 0 { lo } else { Some(node.key_ptr(i - 1)) };
            let child_hi = if i == nk { hi } else { Some(node.key_ptr(i)) };
            self.check_subtree(
                node.child(i),
                id,
                depth + 1,
                child_lo,
                child_hi,
                seen_keys,
                seen_nodes,
            )?;
        }
        Ok(())
    }
}

impl Drop for RawTree {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for RawTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTree")
            .field("degree", &self.layout.degree())
            .field("key_count", &self.key_count)
            .field("node_count", &self.node_count)
            .field("height", &self.height)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Edge {
    Leftmost,
    Rightmost,
}

/// Distributes `n` entries over a run of sibling nodes: full nodes of
/// `max_keys` entries with one entry reserved between nodes as the parent
/// separator, and a tail split in two when cutting it off whole would
/// leave the last node under `min_keys`.
fn chunk_level(n: usize, max_keys: usize, min_keys: usize) -> Vec<usize> {
    debug_assert!(n >= 1);
    let mut counts = Vec::new();
    let mut remaining = n;
    loop {
        if remaining <= max_keys {
            counts.push(remaining);
            break;
        }
        if remaining >= max_keys + 1 + min_keys {
            counts.push(max_keys);
            remaining -= max_keys + 1;
        } else {
            let tail = remaining - 1;
            counts.push(tail - tail / 2);
            counts.push(tail / 2);
            break;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_level_fills_greedily() {
        // Degree 3: max 5, min 2.
        assert_eq!(chunk_level(5, 5, 2), vec![5]);
        assert_eq!(chunk_level(11, 5, 2), vec![5, 5]);
        // 12 entries: one full leaf, then the 6-entry tail splits 3/2
        // around a separator so the last leaf stays at minimum occupancy.
        assert_eq!(chunk_level(12, 5, 2), vec![5, 3, 2]);
    }

    #[test]
    fn chunk_level_tail_never_underflows() {
        for max in [5usize, 7, 31] {
            let min = max / 2;
            for n in 1..=400 {
                let counts = chunk_level(n, max, min);
                let consumed: usize = counts.iter().sum::<usize>() + counts.len() - 1;
                assert_eq!(consumed, n, "n={} max={}", n, max);
                assert!(counts.iter().all(|&c| c <= max));
                if counts.len() > 1 {
                    assert!(counts.iter().all(|&c| c >= min), "n={} max={}", n, max);
                }
            }
        }
    }

    #[test]
    fn tree_flags_compose() {
        let flags = TreeFlags::ALLOW_DUPLICATES | TreeFlags::THREAD_SAFE;
        assert!(flags.contains(TreeFlags::ALLOW_DUPLICATES));
        assert!(flags.contains(TreeFlags::THREAD_SAFE));
        assert!(!flags.contains(TreeFlags::CASE_INSENSITIVE));
    }

    #[test]
    fn stats_display_is_compact() {
        let stats = TreeStats {
            key_count: 7,
            node_count: 3,
            height: 2,
            degree: 3,
            memory_bytes: 1024,
        };
        assert_eq!(stats.to_string(), "keys:7,nodes:3,height:2,degree:3,memory:1024B");
    }
}
