//! # Node Views
//!
//! Borrowed views over a single node block, exposing only the primitives
//! the engine composes: `locate`, `insert_at`, `remove_at`, and the raw
//! slot accessors. The views check their own preconditions (slot bounds,
//! capacity) and nothing more; global invariants such as balance and key
//! separation are the engine's business.
//!
//! ## Aliasing Discipline
//!
//! A view is constructed from a raw block pointer and the tree's layout.
//! The constructor is unsafe: the caller guarantees the block is a live,
//! initialized node of the owning tree and that no other view of the same
//! block exists while a `NodeMut` is alive. The engine upholds this by
//! construction: it materializes at most one mutable view at a time per
//! node and never holds views across node allocation or release.
//!
//! ## Move Semantics
//!
//! `insert_at` copies payloads in from source pointers whose ownership the
//! caller forfeits; `shift_out` relocates payloads without running
//! destructors (for separators that were moved elsewhere); `remove_at`
//! destroys the slot payload first and then shifts. Together these keep
//! the destructor count at exactly one per logical payload.

use std::cmp::Ordering;
use std::ptr::{self, NonNull};

use zerocopy::IntoBytes;

use crate::caps::TypeCaps;
use crate::memory::{BlockId, NIL_BLOCK};
use crate::tree::layout::{NodeHeader, NodeLayout, HEADER_SIZE};

/// Outcome of a key search inside one node: the matching slot, or the gap
/// where the key would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchResult {
    Found(usize),
    NotFound(usize),
}

/// Shared view of a node block.
#[derive(Clone, Copy)]
pub(crate) struct NodeRef<'a> {
    base: NonNull<u8>,
    layout: &'a NodeLayout,
}

/// Exclusive view of a node block.
pub(crate) struct NodeMut<'a> {
    base: NonNull<u8>,
    layout: &'a NodeLayout,
}

impl<'a> NodeRef<'a> {
    /// # Safety
    ///
    /// `base` must point to a live, initialized node block laid out per
    /// `layout`, with no exclusive view of the same block alive.
    pub unsafe fn new(base: NonNull<u8>, layout: &'a NodeLayout) -> Self {
        Self { base, layout }
    }

    #[inline]
    fn header(&self) -> &NodeHeader {
        // Block alignment (64) exceeds the header's, so the cast is sound.
        unsafe { &*(self.base.as_ptr() as *const NodeHeader) }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.header().leaf != 0
    }

    #[inline]
    pub fn num_keys(&self) -> usize {
        self.header().num_keys as usize
    }

    #[inline]
    pub fn parent(&self) -> BlockId {
        self.header().parent
    }

    #[inline]
    pub fn key_ptr(&self, i: usize) -> *const u8 {
        debug_assert!(i < self.layout.max_keys());
        // SAFETY: the offset stays inside the block for any legal slot.
        unsafe {
            self.base
                .as_ptr()
                .add(self.layout.keys_off() + i * self.layout.key_size())
        }
    }

    #[inline]
    pub fn value_ptr(&self, i: usize) -> *const u8 {
        debug_assert!(i < self.layout.max_keys());
        unsafe {
            self.base
                .as_ptr()
                .add(self.layout.values_off() + i * self.layout.value_size())
        }
    }

    /// Child block id at slot `i`; meaningful only for internal nodes and
    /// `i <= num_keys`.
    #[inline]
    pub fn child(&self, i: usize) -> BlockId {
        debug_assert!(i <= self.layout.max_keys());
        // SAFETY: the child run is 4-aligned and in bounds for any legal
        // slot.
        unsafe {
            (self.base.as_ptr().add(self.layout.children_off()) as *const BlockId)
                .add(i)
                .read()
        }
    }

    /// Binary search over `K[0..num_keys)`.
    ///
    /// # Safety
    ///
    /// `key` must reference a live key of the tree's key type.
    pub unsafe fn locate(&self, key: *const u8, caps: &TypeCaps) -> SearchResult {
        let mut lo = 0;
        let mut hi = self.num_keys();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match caps.compare(key, self.key_ptr(mid)) {
                Ordering::Equal => return SearchResult::Found(mid),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }
        SearchResult::NotFound(lo)
    }
}

impl<'a> NodeMut<'a> {
    /// # Safety
    ///
    /// `base` must point to a live node block of the owning tree laid out
    /// per `layout`, and this must be the only view of that block.
    pub unsafe fn new(base: NonNull<u8>, layout: &'a NodeLayout) -> Self {
        Self { base, layout }
    }

    /// Stamps a fresh header: empty, parentless, with the given leafness.
    pub fn init(&mut self, leaf: bool) {
        let header = NodeHeader {
            leaf: leaf as u16,
            num_keys: 0,
            parent: NIL_BLOCK,
        };
        // SAFETY: the block is at least HEADER_SIZE bytes.
        let dst = unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), HEADER_SIZE) };
        dst.copy_from_slice(header.as_bytes());
    }

    #[inline]
    pub fn as_ref(&self) -> NodeRef<'_> {
        // SAFETY: the shared view borrows self, so exclusivity holds.
        unsafe { NodeRef::new(self.base, self.layout) }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut NodeHeader {
        // SAFETY: exclusive view; alignment as in NodeRef::header.
        unsafe { &mut *(self.base.as_ptr() as *mut NodeHeader) }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.as_ref().is_leaf()
    }

    #[inline]
    pub fn num_keys(&self) -> usize {
        self.as_ref().num_keys()
    }

    #[inline]
    pub fn parent(&self) -> BlockId {
        self.as_ref().parent()
    }

    #[inline]
    pub fn child(&self, i: usize) -> BlockId {
        self.as_ref().child(i)
    }

    #[inline]
    pub fn key_ptr(&self, i: usize) -> *const u8 {
        self.as_ref().key_ptr(i)
    }

    #[inline]
    pub fn value_ptr(&self, i: usize) -> *const u8 {
        self.as_ref().value_ptr(i)
    }

    #[inline]
    pub fn key_ptr_mut(&mut self, i: usize) -> *mut u8 {
        self.as_ref().key_ptr(i) as *mut u8
    }

    #[inline]
    pub fn value_ptr_mut(&mut self, i: usize) -> *mut u8 {
        self.as_ref().value_ptr(i) as *mut u8
    }

    /// See [`NodeRef::locate`].
    ///
    /// # Safety
    ///
    /// `key` must reference a live key of the tree's key type.
    pub unsafe fn locate(&self, key: *const u8, caps: &TypeCaps) -> SearchResult {
        self.as_ref().locate(key, caps)
    }

    pub fn set_parent(&mut self, parent: BlockId) {
        self.header_mut().parent = parent;
    }

    pub fn set_num_keys(&mut self, n: usize) {
        debug_assert!(n <= self.layout.max_keys());
        self.header_mut().num_keys = n as u16;
    }

    pub fn set_child(&mut self, i: usize, id: BlockId) {
        debug_assert!(i <= self.layout.max_keys());
        // SAFETY: exclusive view; slot in bounds and 4-aligned.
        unsafe {
            (self.base.as_ptr().add(self.layout.children_off()) as *mut BlockId)
                .add(i)
                .write(id)
        };
    }

    /// Shifts child ids `[from..child_count)` one slot right, opening slot
    /// `from` for the caller to fill.
    pub fn shift_children_right(&mut self, from: usize, child_count: usize) {
        debug_assert!(from <= child_count);
        debug_assert!(child_count <= self.layout.max_keys());
        if from == child_count {
            return;
        }
        // SAFETY: exclusive view; source and destination ranges lie inside
        // the child run.
        unsafe {
            let children = self.base.as_ptr().add(self.layout.children_off()) as *mut BlockId;
            ptr::copy(children.add(from), children.add(from + 1), child_count - from);
        }
    }

    /// Shifts child ids `[from..child_count)` one slot left, overwriting
    /// slot `from - 1`.
    pub fn shift_children_left(&mut self, from: usize, child_count: usize) {
        debug_assert!(from >= 1 && from <= child_count);
        debug_assert!(child_count <= self.layout.max_keys() + 1);
        if from == child_count {
            return;
        }
        // SAFETY: exclusive view; source and destination ranges lie inside
        // the child run.
        unsafe {
            let children = self.base.as_ptr().add(self.layout.children_off()) as *mut BlockId;
            ptr::copy(children.add(from), children.add(from - 1), child_count - from);
        }
    }

    /// Shifts the key/value suffix right and places the new payload at
    /// slot `i`. Child slots are untouched; internal-node callers open a
    /// child slot explicitly with [`shift_children_right`].
    ///
    /// Precondition: `num_keys < max_keys` and `i <= num_keys`.
    ///
    /// # Safety
    ///
    /// `key` and `value` must reference live payloads of the tree's types;
    /// ownership transfers to the node.
    ///
    /// [`shift_children_right`]: Self::shift_children_right
    pub unsafe fn insert_at(&mut self, i: usize, key: *const u8, value: *const u8, caps: &TypeCaps) {
        let nk = self.num_keys();
        debug_assert!(nk < self.layout.max_keys());
        debug_assert!(i <= nk);

        if i < nk {
            caps.key().shift(self.key_ptr(i), self.key_ptr_mut(i + 1), nk - i);
            caps.value()
                .shift(self.value_ptr(i), self.value_ptr_mut(i + 1), nk - i);
        }
        caps.key().copy_to(key, self.key_ptr_mut(i), 1);
        caps.value().copy_to(value, self.value_ptr_mut(i), 1);
        self.set_num_keys(nk + 1);
    }

    /// Destroys the payload at slot `i`, then closes the gap.
    ///
    /// Precondition: `i < num_keys`.
    ///
    /// # Safety
    ///
    /// Slot `i` must hold a live payload that nothing else references.
    pub unsafe fn remove_at(&mut self, i: usize, caps: &TypeCaps) {
        debug_assert!(i < self.num_keys());
        caps.key().drop_in_place(self.key_ptr_mut(i), 1);
        caps.value().drop_in_place(self.value_ptr_mut(i), 1);
        self.shift_out(i, caps);
    }

    /// Closes the gap at slot `i` without running destructors; the
    /// payload there was moved elsewhere. For internal nodes the child
    /// slot `i + 1` is removed alongside the key.
    ///
    /// Precondition: `i < num_keys`.
    ///
    /// # Safety
    ///
    /// The payload at slot `i` must already have been moved out or
    /// destroyed.
    pub unsafe fn shift_out(&mut self, i: usize, caps: &TypeCaps) {
        let nk = self.num_keys();
        debug_assert!(i < nk);

        if i + 1 < nk {
            caps.key().shift(self.key_ptr(i + 1), self.key_ptr_mut(i), nk - i - 1);
            caps.value()
                .shift(self.value_ptr(i + 1), self.value_ptr_mut(i), nk - i - 1);
        }
        if !self.is_leaf() {
            // SAFETY: exclusive view; ranges lie inside the child run.
            let children = self.base.as_ptr().add(self.layout.children_off()) as *mut BlockId;
            ptr::copy(children.add(i + 2), children.add(i + 1), nk - i - 1);
        }
        self.set_num_keys(nk - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_POOL_SIZE;
    use crate::memory::{PoolFlags, SlabPool};

    fn setup() -> (TypeCaps, NodeLayout, SlabPool) {
        let caps = TypeCaps::of::<i64, u64>();
        let layout = NodeLayout::new(3, &caps).unwrap();
        let pool = SlabPool::create(layout.block_size(), MIN_POOL_SIZE, PoolFlags::NONE).unwrap();
        (caps, layout, pool)
    }

    fn fresh_node<'a>(pool: &SlabPool, layout: &'a NodeLayout, leaf: bool) -> NodeMut<'a> {
        let id = pool.alloc_block().unwrap();
        let mut node = unsafe { NodeMut::new(pool.block_ptr(id), layout) };
        node.init(leaf);
        node
    }

    unsafe fn put(node: &mut NodeMut<'_>, i: usize, key: i64, value: u64, caps: &TypeCaps) {
        node.insert_at(
            i,
            &key as *const i64 as *const u8,
            &value as *const u64 as *const u8,
            caps,
        );
    }

    fn key_at(node: &NodeMut<'_>, i: usize) -> i64 {
        unsafe { (node.key_ptr(i) as *const i64).read() }
    }

    fn value_at(node: &NodeMut<'_>, i: usize) -> u64 {
        unsafe { (node.value_ptr(i) as *const u64).read() }
    }

    #[test]
    fn init_produces_an_empty_parentless_node() {
        let (_caps, layout, pool) = setup();
        let node = fresh_node(&pool, &layout, true);

        assert!(node.is_leaf());
        assert_eq!(node.num_keys(), 0);
        assert_eq!(node.parent(), NIL_BLOCK);
    }

    #[test]
    fn insert_at_keeps_slots_ordered() {
        let (caps, layout, pool) = setup();
        let mut node = fresh_node(&pool, &layout, true);

        unsafe {
            put(&mut node, 0, 30, 300, &caps);
            put(&mut node, 0, 10, 100, &caps);
            put(&mut node, 1, 20, 200, &caps);
        }

        assert_eq!(node.num_keys(), 3);
        assert_eq!(
            (0..3).map(|i| key_at(&node, i)).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        assert_eq!(value_at(&node, 1), 200);
    }

    #[test]
    fn locate_distinguishes_hit_and_gap() {
        let (caps, layout, pool) = setup();
        let mut node = fresh_node(&pool, &layout, true);

        for (i, k) in [10i64, 20, 40].iter().enumerate() {
            unsafe { put(&mut node, i, *k, 0, &caps) };
        }

        let probe = |k: i64| unsafe { node.locate(&k as *const i64 as *const u8, &caps) };
        assert_eq!(probe(20), SearchResult::Found(1));
        assert_eq!(probe(5), SearchResult::NotFound(0));
        assert_eq!(probe(30), SearchResult::NotFound(2));
        assert_eq!(probe(99), SearchResult::NotFound(3));
    }

    #[test]
    fn remove_at_closes_the_gap() {
        let (caps, layout, pool) = setup();
        let mut node = fresh_node(&pool, &layout, true);

        for (i, k) in [10i64, 20, 30].iter().enumerate() {
            unsafe { put(&mut node, i, *k, *k as u64 * 10, &caps) };
        }
        unsafe { node.remove_at(1, &caps) };

        assert_eq!(node.num_keys(), 2);
        assert_eq!(key_at(&node, 0), 10);
        assert_eq!(key_at(&node, 1), 30);
        assert_eq!(value_at(&node, 1), 300);
    }

    #[test]
    fn internal_shift_out_drops_the_right_child() {
        let (caps, layout, pool) = setup();
        let mut node = fresh_node(&pool, &layout, false);

        for (i, k) in [10i64, 20].iter().enumerate() {
            unsafe { put(&mut node, i, *k, 0, &caps) };
        }
        for (i, c) in [100u32, 200, 300].iter().enumerate() {
            node.set_child(i, *c);
        }

        // Dropping key 0 removes child 1; children become [100, 300].
        unsafe { node.shift_out(0, &caps) };

        assert_eq!(node.num_keys(), 1);
        assert_eq!(key_at(&node, 0), 20);
        assert_eq!(node.child(0), 100);
        assert_eq!(node.child(1), 300);
    }

    #[test]
    fn shift_children_right_opens_a_slot() {
        let (caps, layout, pool) = setup();
        let mut node = fresh_node(&pool, &layout, false);

        unsafe { put(&mut node, 0, 10, 0, &caps) };
        node.set_child(0, 7);
        node.set_child(1, 8);

        node.shift_children_right(0, 2);
        node.set_child(0, 5);

        assert_eq!(node.child(0), 5);
        assert_eq!(node.child(1), 7);
        assert_eq!(node.child(2), 8);
    }

    #[test]
    fn remove_at_runs_destructors_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(PartialEq, Eq, PartialOrd, Ord)]
        struct Counted(i64);
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let caps = TypeCaps::of::<Counted, u64>();
        let layout = NodeLayout::new(3, &caps).unwrap();
        let pool = SlabPool::create(layout.block_size(), MIN_POOL_SIZE, PoolFlags::NONE).unwrap();
        let mut node = fresh_node(&pool, &layout, true);

        let key = Counted(1);
        let value = 10u64;
        unsafe {
            node.insert_at(
                0,
                &key as *const Counted as *const u8,
                &value as *const u64 as *const u8,
                &caps,
            );
        }
        std::mem::forget(key);

        unsafe { node.remove_at(0, &caps) };
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        assert_eq!(node.num_keys(), 0);
    }
}
