//! # Typed Front-End
//!
//! [`BTree<K, V>`] wraps the type-erased engine behind a safe generic
//! API: payload sizes, the comparator, and the destructor all derive from
//! the type parameters, and the borrow checker enforces the single-writer
//! rule and iterator validity at compile time.
//!
//! ## Quick Start
//!
//! ```ignore
//! use slabtree::BTree;
//!
//! let mut tree: BTree<u32, String> = BTree::new(16)?;
//! tree.insert(1, "one".into())?;
//! tree.insert(2, "two".into())?;
//!
//! assert_eq!(tree.get(&2).map(String::as_str), Some("two"));
//! assert_eq!(tree.len(), 2);
//! ```
//!
//! ## Construction
//!
//! [`BTree::new`] draws node blocks from the process-wide memory
//! manager. The [builder](BTree::builder) selects a degree, flags, a
//! custom comparator, or an explicit pool:
//!
//! ```ignore
//! let pool = SlabPool::create(block, 1 << 20, PoolFlags::TRACK_STATS)?;
//! let mut tree = BTree::<u64, u64>::builder()
//!     .degree(8)
//!     .allow_duplicates(true)
//!     .pool(pool)
//!     .build()?;
//! ```
//!
//! ## Ownership
//!
//! `insert` and `bulk_insert` move payloads into the tree; `delete` and
//! `clear` run their destructors exactly once; dropping the tree clears
//! it. `get` and the iterators hand out borrows tied to the tree borrow,
//! so no reference survives a mutation.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;

use eyre::Result;

use crate::caps::TypeCaps;
use crate::config::DEFAULT_DEGREE;
use crate::memory::{MemoryManager, SlabPool};
use crate::tree::iter::RawCursor;
use crate::tree::layout::NodeLayout;
use crate::tree::{RawTree, TreeFlags, TreeStats};

/// An ordered map over slab-allocated B-Tree nodes.
pub struct BTree<K: Ord + 'static, V: 'static> {
    raw: RawTree,
    _marker: PhantomData<(K, V)>,
}

impl<K: Ord + 'static, V: 'static> BTree<K, V> {
    /// Creates an empty tree of the given degree, drawing node blocks
    /// from the process-wide memory manager.
    pub fn new(degree: usize) -> Result<Self> {
        Self::builder().degree(degree).build()
    }

    /// Starts a builder with the default degree and no flags.
    pub fn builder() -> BTreeBuilder<K, V> {
        BTreeBuilder {
            degree: DEFAULT_DEGREE,
            flags: TreeFlags::NONE,
            pool: None,
            comparator: None,
            _marker: PhantomData,
        }
    }

    fn caps(&self) -> TypeCaps {
        self.raw.caps().clone()
    }

    /// Inserts one pair. `DuplicateKey` when the key is already present
    /// and duplicates are disallowed; `MemoryAllocation` when the pool is
    /// exhausted. Either way a failed insert leaves the tree untouched
    /// and drops the rejected payloads.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let caps = self.caps();
        let key = ManuallyDrop::new(key);
        let value = ManuallyDrop::new(value);
        // SAFETY: the pointers reference the two live stack slots; on
        // success their ownership has moved into the tree.
        let result = unsafe {
            self.raw.insert(
                &caps,
                &*key as *const K as *const u8,
                &*value as *const V as *const u8,
            )
        };
        if result.is_err() {
            // Ownership stayed here; give the payloads a normal drop.
            let _ = ManuallyDrop::into_inner(key);
            let _ = ManuallyDrop::into_inner(value);
        }
        result
    }

    /// Point lookup. The borrow is valid until the next mutation.
    pub fn get(&self, key: &K) -> Option<&V> {
        let caps = self.caps();
        // SAFETY: the key reference is live; the returned pointer borrows
        // a value slot that outlives the shared borrow of self.
        unsafe {
            match self.raw.search(&caps, key as *const K as *const u8) {
                Ok(Some(value)) => Some(&*(value.as_ptr() as *const V)),
                _ => None,
            }
        }
    }

    /// Membership test.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Removes one pair, running both destructors. `KeyNotFound` when
    /// absent, in which case the tree is untouched.
    pub fn delete(&mut self, key: &K) -> Result<()> {
        let caps = self.caps();
        // SAFETY: the key reference is live.
        unsafe { self.raw.delete(&caps, key as *const K as *const u8) }
    }

    /// Builds the tree bottom-up from pre-sorted pairs. The tree must be
    /// empty; unsorted input is rejected with `InvalidOperation` and
    /// adjacent equal keys with `DuplicateKey` (unless duplicates are
    /// allowed). On any error the input is dropped and the tree stays
    /// empty.
    pub fn bulk_insert(&mut self, pairs: Vec<(K, V)>) -> Result<()> {
        let caps = self.caps();
        let (mut keys, mut values): (Vec<K>, Vec<V>) = pairs.into_iter().unzip();
        // SAFETY: the two buffers hold keys.len() live payloads each.
        let result = unsafe {
            self.raw.bulk_load(
                &caps,
                keys.as_ptr() as *const u8,
                values.as_ptr() as *const u8,
                keys.len(),
            )
        };
        if result.is_ok() {
            // SAFETY: every payload moved into the tree; the buffers must
            // not drop them a second time.
            unsafe {
                keys.set_len(0);
                values.set_len(0);
            }
        }
        result
    }

    /// Collects up to `max_results` pairs with `lo <= key <= hi`, in
    /// ascending order.
    pub fn range_search(&self, lo: &K, hi: &K, max_results: usize) -> Vec<(&K, &V)> {
        let caps = self.caps();
        // SAFETY: both key references are live; the returned pointers
        // borrow slots that outlive the shared borrow of self.
        unsafe {
            match self.raw.range_search(
                &caps,
                lo as *const K as *const u8,
                hi as *const K as *const u8,
                max_results,
            ) {
                Ok(pairs) => pairs
                    .into_iter()
                    .map(|(key, value)| {
                        (&*(key.as_ptr() as *const K), &*(value.as_ptr() as *const V))
                    })
                    .collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    /// Releases every pair and node. Infallible.
    pub fn clear(&mut self) {
        self.raw.clear();
    }

    /// Number of pairs stored.
    pub fn len(&self) -> usize {
        self.raw.key_count()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Edges from root to leaf, plus one; zero when empty.
    pub fn height(&self) -> usize {
        self.raw.height()
    }

    pub fn degree(&self) -> usize {
        self.raw.degree()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TreeStats {
        self.raw.stats()
    }

    /// The pool this tree draws node blocks from.
    pub fn pool(&self) -> &SlabPool {
        self.raw.pool()
    }

    /// Structural verifier; see [`RawTree::check_invariants`].
    pub fn check_invariants(&self) -> Result<()> {
        self.raw.check_invariants()
    }

    /// Ascending iterator over the whole tree.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cursor: RawCursor::all_forward(&self.raw),
            _marker: PhantomData,
        }
    }

    /// Descending iterator over the whole tree.
    pub fn iter_rev(&self) -> Iter<'_, K, V> {
        Iter {
            cursor: RawCursor::all_reverse(&self.raw),
            _marker: PhantomData,
        }
    }

    /// Ascending iterator over `[lo, hi]`, with each bound inclusive or
    /// exclusive.
    pub fn range<'a>(
        &'a self,
        lo: &K,
        hi: &'a K,
        lo_inclusive: bool,
        hi_inclusive: bool,
    ) -> Range<'a, K, V> {
        // SAFETY: the lower bound reference is live for the seeding walk.
        let cursor =
            unsafe { RawCursor::from_lower(&self.raw, lo as *const K as *const u8, lo_inclusive) };
        Range {
            cursor,
            caps: self.caps(),
            stop: hi,
            stop_inclusive: hi_inclusive,
            descending: false,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Descending iterator over `[lo, hi]`, with each bound inclusive or
    /// exclusive.
    pub fn range_rev<'a>(
        &'a self,
        lo: &'a K,
        hi: &K,
        lo_inclusive: bool,
        hi_inclusive: bool,
    ) -> Range<'a, K, V> {
        // SAFETY: the upper bound reference is live for the seeding walk.
        let cursor =
            unsafe { RawCursor::from_upper(&self.raw, hi as *const K as *const u8, hi_inclusive) };
        Range {
            cursor,
            caps: self.caps(),
            stop: lo,
            stop_inclusive: lo_inclusive,
            descending: true,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl<K: Ord + 'static, V: 'static> std::fmt::Debug for BTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("len", &self.len())
            .field("height", &self.height())
            .field("degree", &self.degree())
            .finish()
    }
}

/// Configures and builds a [`BTree`].
pub struct BTreeBuilder<K: Ord + 'static, V: 'static> {
    degree: usize,
    flags: TreeFlags,
    pool: Option<SlabPool>,
    comparator: Option<fn(&K, &K) -> Ordering>,
    _marker: PhantomData<(K, V)>,
}

impl<K: Ord + 'static, V: 'static> BTreeBuilder<K, V> {
    /// Branching factor `t`, in `[3, 1024]`.
    pub fn degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    /// Permits equal keys; insertion breaks ties to the left.
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        if allow {
            self.flags = self.flags | TreeFlags::ALLOW_DUPLICATES;
        }
        self
    }

    /// Draws node blocks from an explicit pool instead of the process
    /// manager. The pool's blocks must be at least the tree's node size.
    pub fn pool(mut self, pool: SlabPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Orders keys by `compare` instead of `K`'s [`Ord`].
    pub fn comparator(mut self, compare: fn(&K, &K) -> Ordering) -> Self {
        self.comparator = Some(compare);
        self
    }

    /// Validates the configuration and creates the tree.
    pub fn build(self) -> Result<BTree<K, V>> {
        let caps = match self.comparator {
            Some(compare) => TypeCaps::with_comparator::<K, V>(compare),
            None => TypeCaps::of::<K, V>(),
        };
        let layout = NodeLayout::new(self.degree, &caps)?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => MemoryManager::global().pool_for(layout.block_size())?,
        };
        let mut raw = RawTree::new(self.degree, caps, pool)?;
        raw.set_flags(self.flags);
        Ok(BTree {
            raw,
            _marker: PhantomData,
        })
    }
}

/// Ascending or descending iterator over the whole tree.
pub struct Iter<'a, K: 'static, V: 'static> {
    cursor: RawCursor<'a>,
    _marker: PhantomData<(&'a K, &'a V)>,
}

impl<'a, K: 'static, V: 'static> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.cursor.advance()?;
        // SAFETY: the cursor yields pointers to live slots; the borrow of
        // the tree held by the cursor pins them for 'a.
        unsafe {
            Some((
                &*(key.as_ptr() as *const K),
                &*(value.as_ptr() as *const V),
            ))
        }
    }
}

/// Bounded-range iterator; see [`BTree::range`] and [`BTree::range_rev`].
pub struct Range<'a, K: 'static, V: 'static> {
    cursor: RawCursor<'a>,
    caps: TypeCaps,
    stop: &'a K,
    stop_inclusive: bool,
    descending: bool,
    done: bool,
    _marker: PhantomData<(&'a K, &'a V)>,
}

impl<'a, K: 'static, V: 'static> Iterator for Range<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (key, value) = self.cursor.advance()?;
        // SAFETY: both operands reference live keys; yielded pointers are
        // pinned for 'a by the cursor's tree borrow.
        unsafe {
            let ord = self
                .caps
                .compare(key.as_ptr(), self.stop as *const K as *const u8);
            let past = if self.descending {
                ord == Ordering::Less || (!self.stop_inclusive && ord == Ordering::Equal)
            } else {
                ord == Ordering::Greater || (!self.stop_inclusive && ord == Ordering::Equal)
            };
            if past {
                self.done = true;
                return None;
            }
            Some((
                &*(key.as_ptr() as *const K),
                &*(value.as_ptr() as *const V),
            ))
        }
    }
}
