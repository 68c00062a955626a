//! # Ordered Cursors
//!
//! Lazy in-order traversal over `(key, value)` slot pairs. A cursor keeps
//! an explicit descent stack of `(node, slot)` entries, O(height) to
//! construct and O(1) amortized per step, and never touches the tree beyond
//! reading it.
//!
//! ## Stack Discipline
//!
//! Forward entries `(node, idx)` mean: subtrees `C[0..=idx]` are emitted;
//! when the entry surfaces, key `idx` is yielded and the left spine of
//! `C[idx + 1]` is pushed above it. Reverse entries mirror this with the
//! index counting down. Seeding for a bounded range descends the `lo`
//! (or `hi`) spine, leaving one entry per level so the walk resumes
//! correctly on the way back up.
//!
//! ## Invalidation
//!
//! A cursor captures the tree's mutation epoch at construction;
//! [`RawCursor::next`] reports `InvalidOperation` once the tree has
//! mutated underneath it. The typed iterators borrow the tree for their
//! whole lifetime, which turns the same rule into a compile-time
//! guarantee; they step through [`RawCursor::advance`] directly.

use std::ptr::NonNull;

use eyre::Result;
use smallvec::SmallVec;

use crate::error::TreeError;
use crate::memory::BlockId;
use crate::tree::node::SearchResult;
use crate::tree::raw::RawTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// A read-only cursor over one tree. Yields raw slot-pointer pairs; the
/// typed iterators wrap them into references.
pub(crate) struct RawCursor<'a> {
    tree: &'a RawTree,
    stack: SmallVec<[(BlockId, u16); 12]>,
    dir: Direction,
    epoch: u64,
}

impl<'a> RawCursor<'a> {
    fn empty(tree: &'a RawTree, dir: Direction) -> Self {
        Self {
            tree,
            stack: SmallVec::new(),
            dir,
            epoch: tree.epoch(),
        }
    }

    /// Whole tree, ascending.
    pub fn all_forward(tree: &'a RawTree) -> Self {
        let mut cursor = Self::empty(tree, Direction::Forward);
        if let Some(root) = tree.root_id() {
            cursor.push_left_spine(root);
        }
        cursor
    }

    /// Whole tree, descending.
    pub fn all_reverse(tree: &'a RawTree) -> Self {
        let mut cursor = Self::empty(tree, Direction::Reverse);
        if let Some(root) = tree.root_id() {
            cursor.push_right_spine(root);
        }
        cursor
    }

    /// Ascending, positioned at the first key not less than `key`
    /// (greater than, when `inclusive` is false).
    ///
    /// # Safety
    ///
    /// `key` must reference a live key of the tree's key type.
    pub unsafe fn from_lower(tree: &'a RawTree, key: *const u8, inclusive: bool) -> Self {
        let mut cursor = Self::empty(tree, Direction::Forward);
        let Some(mut id) = tree.root_id() else {
            return cursor;
        };
        loop {
            let node = tree.node(id);
            let slot = match node.locate(key, tree.caps()) {
                SearchResult::Found(i) => {
                    if inclusive {
                        i
                    } else {
                        i + 1
                    }
                }
                SearchResult::NotFound(gap) => gap,
            };
            cursor.stack.push((id, slot as u16));
            if node.is_leaf() {
                return cursor;
            }
            id = node.child(slot);
        }
    }

    /// Descending, positioned at the last key not greater than `key`
    /// (less than, when `inclusive` is false).
    ///
    /// # Safety
    ///
    /// `key` must reference a live key of the tree's key type.
    pub unsafe fn from_upper(tree: &'a RawTree, key: *const u8, inclusive: bool) -> Self {
        let mut cursor = Self::empty(tree, Direction::Reverse);
        let Some(mut id) = tree.root_id() else {
            return cursor;
        };
        loop {
            let node = tree.node(id);
            let slot = match node.locate(key, tree.caps()) {
                SearchResult::Found(i) => {
                    if inclusive {
                        i + 1
                    } else {
                        i
                    }
                }
                SearchResult::NotFound(gap) => gap,
            };
            cursor.stack.push((id, slot as u16));
            if node.is_leaf() {
                return cursor;
            }
            id = node.child(slot);
        }
    }

    fn push_left_spine(&mut self, mut id: BlockId) {
        loop {
            self.stack.push((id, 0));
            let node = self.tree.node(id);
            if node.is_leaf() {
                return;
            }
            id = node.child(0);
        }
    }

    fn push_right_spine(&mut self, mut id: BlockId) {
        loop {
            let node = self.tree.node(id);
            let nk = node.num_keys();
            self.stack.push((id, nk as u16));
            if node.is_leaf() {
                return;
            }
            id = node.child(nk);
        }
    }

    fn item(&self, id: BlockId, slot: usize) -> (NonNull<u8>, NonNull<u8>) {
        let node = self.tree.node(id);
        // SAFETY: slot pointers inside a live block are non-null.
        unsafe {
            (
                NonNull::new_unchecked(node.key_ptr(slot) as *mut u8),
                NonNull::new_unchecked(node.value_ptr(slot) as *mut u8),
            )
        }
    }

    /// Steps the cursor without an epoch check; the typed iterators hold
    /// a borrow of the tree for their whole lifetime, so no mutation can
    /// intervene.
    pub fn advance(&mut self) -> Option<(NonNull<u8>, NonNull<u8>)> {
        match self.dir {
            Direction::Forward => loop {
                let &(id, idx) = self.stack.last()?;
                let node = self.tree.node(id);
                let idx = idx as usize;
                if idx < node.num_keys() {
                    let top = self.stack.len() - 1;
                    self.stack[top].1 = (idx + 1) as u16;
                    let pair = self.item(id, idx);
                    if !node.is_leaf() {
                        self.push_left_spine(node.child(idx + 1));
                    }
                    return Some(pair);
                }
                self.stack.pop();
            },
            Direction::Reverse => loop {
                let &(id, idx) = self.stack.last()?;
                let node = self.tree.node(id);
                let idx = idx as usize;
                if idx > 0 {
                    let top = self.stack.len() - 1;
                    self.stack[top].1 = (idx - 1) as u16;
                    let pair = self.item(id, idx - 1);
                    if !node.is_leaf() {
                        self.push_right_spine(node.child(idx - 1));
                    }
                    return Some(pair);
                }
                self.stack.pop();
            },
        }
    }

    /// Epoch-checked step: fails with `InvalidOperation` once the tree
    /// has mutated since the cursor was built.
    pub fn next(&mut self) -> Result<Option<(NonNull<u8>, NonNull<u8>)>> {
        tree_ensure!(
            self.epoch == self.tree.epoch(),
            TreeError::InvalidOperation("iterator invalidated by a tree mutation")
        );
        Ok(self.advance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::TypeCaps;
    use crate::config::MIN_POOL_SIZE;
    use crate::memory::{PoolFlags, SlabPool};
    use crate::tree::layout::NodeLayout;

    fn build_tree(keys: &[i64]) -> RawTree {
        let caps = TypeCaps::of::<i64, i64>();
        let layout = NodeLayout::new(3, &caps).unwrap();
        let pool = SlabPool::create(layout.block_size(), MIN_POOL_SIZE, PoolFlags::NONE).unwrap();
        let mut tree = RawTree::new(3, caps, pool).unwrap();
        let caps = tree.caps().clone();
        for &k in keys {
            let v = k * 10;
            unsafe {
                tree.insert(
                    &caps,
                    &k as *const i64 as *const u8,
                    &v as *const i64 as *const u8,
                )
                .unwrap();
            }
        }
        tree
    }

    fn collect(cursor: &mut RawCursor<'_>) -> Vec<i64> {
        let mut keys = Vec::new();
        while let Some((key, _)) = cursor.advance() {
            keys.push(unsafe { (key.as_ptr() as *const i64).read() });
        }
        keys
    }

    #[test]
    fn forward_yields_ascending_order() {
        let tree = build_tree(&[5, 1, 9, 3, 7, 2, 8, 4, 6]);
        let mut cursor = RawCursor::all_forward(&tree);
        assert_eq!(collect(&mut cursor), (1..=9).collect::<Vec<i64>>());
    }

    #[test]
    fn reverse_yields_descending_order() {
        let tree = build_tree(&[5, 1, 9, 3, 7, 2, 8, 4, 6]);
        let mut cursor = RawCursor::all_reverse(&tree);
        assert_eq!(collect(&mut cursor), (1..=9).rev().collect::<Vec<i64>>());
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let caps = TypeCaps::of::<i64, i64>();
        let layout = NodeLayout::new(3, &caps).unwrap();
        let pool = SlabPool::create(layout.block_size(), MIN_POOL_SIZE, PoolFlags::NONE).unwrap();
        let tree = RawTree::new(3, caps, pool).unwrap();

        assert!(RawCursor::all_forward(&tree).advance().is_none());
        assert!(RawCursor::all_reverse(&tree).advance().is_none());
    }

    #[test]
    fn lower_bound_positions_at_first_not_less() {
        let tree = build_tree(&[10, 20, 30, 40, 50, 60, 70]);

        let probe = |key: i64, inclusive: bool| {
            let mut cursor =
                unsafe { RawCursor::from_lower(&tree, &key as *const i64 as *const u8, inclusive) };
            collect(&mut cursor)
        };
        assert_eq!(probe(35, true), vec![40, 50, 60, 70]);
        assert_eq!(probe(40, true), vec![40, 50, 60, 70]);
        assert_eq!(probe(40, false), vec![50, 60, 70]);
        assert_eq!(probe(5, true), vec![10, 20, 30, 40, 50, 60, 70]);
        assert_eq!(probe(99, true), Vec::<i64>::new());
    }

    #[test]
    fn upper_bound_positions_at_last_not_greater() {
        let tree = build_tree(&[10, 20, 30, 40, 50, 60, 70]);

        let probe = |key: i64, inclusive: bool| {
            let mut cursor =
                unsafe { RawCursor::from_upper(&tree, &key as *const i64 as *const u8, inclusive) };
            collect(&mut cursor)
        };
        assert_eq!(probe(35, true), vec![30, 20, 10]);
        assert_eq!(probe(30, true), vec![30, 20, 10]);
        assert_eq!(probe(30, false), vec![20, 10]);
        assert_eq!(probe(99, true), vec![70, 60, 50, 40, 30, 20, 10]);
        assert_eq!(probe(5, true), Vec::<i64>::new());
    }

    #[test]
    fn next_reports_invalidation_after_mutation() {
        let mut tree = build_tree(&[1, 2, 3]);
        let caps = tree.caps().clone();
        let epoch_before = tree.epoch();

        let k = 4i64;
        let v = 40i64;
        unsafe {
            tree.insert(&caps, &k as *const i64 as *const u8, &v as *const i64 as *const u8)
                .unwrap();
        }
        assert_ne!(epoch_before, tree.epoch());

        // A cursor carrying a pre-mutation epoch must refuse to step.
        let mut stale = RawCursor::all_forward(&tree);
        stale.epoch = epoch_before;
        let err = stale.next().unwrap_err();
        assert!(err.to_string().contains("invalid operation"));
    }
}
