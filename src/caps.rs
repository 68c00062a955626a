//! # Key/Value Capability
//!
//! A capability describes the payloads a tree stores: byte size, alignment,
//! a total order over keys, and an optional destructor. The engine
//! manipulates payloads exclusively through these hooks and never inspects
//! payload bytes itself, which is what lets a single type-erased engine
//! serve every key/value combination without per-instantiation codegen.
//!
//! ## Construction
//!
//! [`TypeCaps::of`] derives everything from the Rust types: sizes and
//! alignments from the compiler, the comparator from [`Ord`], and the
//! destructor from [`Drop`] (omitted entirely for trivially destructible
//! types). [`TypeCaps::with_comparator`] swaps in a caller-supplied total
//! order, for example to sort case-insensitively.
//!
//! ## Identity
//!
//! Every capability carries a unique token drawn from a process-wide
//! counter. The raw engine compares tokens on each call that accepts a
//! capability; a mismatch against the constructing capability is reported
//! as `TypeMismatch` rather than silently reinterpreting payload bytes.
//!
//! ## Contract
//!
//! The comparator must be deterministic, antisymmetric, and transitive, and
//! must not panic. Copy and move hooks are bitwise; a moved-from slot is
//! treated as uninitialized and the destructor runs exactly once per
//! logical payload, at eviction or tree clear.

use std::cmp::Ordering;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

type CompareFn = Arc<dyn Fn(*const u8, *const u8) -> Ordering + Send + Sync>;
type DropFn = unsafe fn(*mut u8, usize);

/// Describes one payload role (key or value): size, alignment, and the
/// optional destructor. Pure description; no state.
#[derive(Clone)]
pub struct PayloadCaps {
    size: usize,
    align: usize,
    type_name: &'static str,
    drop_fn: Option<DropFn>,
}

impl PayloadCaps {
    fn of<T>() -> Self {
        Self {
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
            type_name: std::any::type_name::<T>(),
            drop_fn: if mem::needs_drop::<T>() {
                Some(drop_slots::<T> as DropFn)
            } else {
                None
            },
        }
    }

    /// Byte size of one payload element.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Required alignment of the payload run.
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Static name of the underlying Rust type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether evicting a payload requires running a destructor.
    #[inline]
    pub fn needs_drop(&self) -> bool {
        self.drop_fn.is_some()
    }

    /// Bulk-copies `n` elements into an uninitialized, non-overlapping
    /// destination. The source is treated as uninitialized afterwards when
    /// the caller intends a move.
    ///
    /// # Safety
    ///
    /// `src` and `dst` must point to at least `n` elements of this payload
    /// type and must not overlap.
    #[inline]
    pub(crate) unsafe fn copy_to(&self, src: *const u8, dst: *mut u8, n: usize) {
        ptr::copy_nonoverlapping(src, dst, n * self.size);
    }

    /// Relocates `n` elements within the same allocation; ranges may
    /// overlap. The vacated slots are treated as uninitialized.
    ///
    /// # Safety
    ///
    /// `src` and `dst` must point to at least `n` elements of this payload
    /// type inside one allocation.
    #[inline]
    pub(crate) unsafe fn shift(&self, src: *const u8, dst: *mut u8, n: usize) {
        ptr::copy(src, dst, n * self.size);
    }

    /// Runs the destructor on `n` consecutive elements. A no-op for
    /// trivially destructible payloads.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `n` initialized elements of this payload type,
    /// and no element may be used or destroyed again afterwards.
    #[inline]
    pub(crate) unsafe fn drop_in_place(&self, ptr: *mut u8, n: usize) {
        if let Some(drop_fn) = self.drop_fn {
            if n > 0 {
                drop_fn(ptr, n);
            }
        }
    }
}

impl std::fmt::Debug for PayloadCaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCaps")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("needs_drop", &self.needs_drop())
            .finish()
    }
}

/// The full capability a tree is built with: key and value descriptors, the
/// key comparator, and a unique identity token.
#[derive(Clone)]
pub struct TypeCaps {
    key: PayloadCaps,
    value: PayloadCaps,
    compare: CompareFn,
    token: u64,
}

impl TypeCaps {
    /// Builds a capability for `K`/`V` using `K`'s [`Ord`] as the total
    /// order.
    pub fn of<K: Ord + 'static, V: 'static>() -> Self {
        Self::build::<K, V>(Arc::new(|a, b| {
            // Callers guarantee both pointers reference live `K` values;
            // see the compare() safety contract.
            let (a, b) = unsafe { (&*(a as *const K), &*(b as *const K)) };
            a.cmp(b)
        }))
    }

    /// Builds a capability for `K`/`V` ordered by a caller-supplied
    /// comparator instead of `K`'s [`Ord`].
    pub fn with_comparator<K: 'static, V: 'static>(cmp: fn(&K, &K) -> Ordering) -> Self {
        Self::build::<K, V>(Arc::new(move |a, b| {
            let (a, b) = unsafe { (&*(a as *const K), &*(b as *const K)) };
            cmp(a, b)
        }))
    }

    fn build<K: 'static, V: 'static>(compare: CompareFn) -> Self {
        Self {
            key: PayloadCaps::of::<K>(),
            value: PayloadCaps::of::<V>(),
            compare,
            token: NEXT_TOKEN.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    /// Key payload descriptor.
    #[inline]
    pub fn key(&self) -> &PayloadCaps {
        &self.key
    }

    /// Value payload descriptor.
    #[inline]
    pub fn value(&self) -> &PayloadCaps {
        &self.value
    }

    /// Unique identity of this capability instance.
    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Orders two keys.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live, initialized keys of the type this
    /// capability was built for.
    #[inline]
    pub(crate) unsafe fn compare(&self, a: *const u8, b: *const u8) -> Ordering {
        (self.compare)(a, b)
    }
}

impl std::fmt::Debug for TypeCaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeCaps")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("token", &self.token)
            .finish()
    }
}

unsafe fn drop_slots<T>(ptr: *mut u8, n: usize) {
    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr as *mut T, n));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn of_derives_sizes_and_alignment() {
        let caps = TypeCaps::of::<u64, u8>();
        assert_eq!(caps.key().size(), 8);
        assert_eq!(caps.key().align(), 8);
        assert_eq!(caps.value().size(), 1);
        assert!(!caps.key().needs_drop());
    }

    #[test]
    fn tokens_are_unique() {
        let a = TypeCaps::of::<u32, u32>();
        let b = TypeCaps::of::<u32, u32>();
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn clone_preserves_token() {
        let a = TypeCaps::of::<u32, u32>();
        let b = a.clone();
        assert_eq!(a.token(), b.token());
    }

    #[test]
    fn compare_uses_ord() {
        let caps = TypeCaps::of::<i32, ()>();
        let (x, y) = (3i32, 7i32);
        let ord = unsafe {
            caps.compare(
                &x as *const i32 as *const u8,
                &y as *const i32 as *const u8,
            )
        };
        assert_eq!(ord, Ordering::Less);
    }

    #[test]
    fn custom_comparator_overrides_ord() {
        let caps = TypeCaps::with_comparator::<i32, ()>(|a, b| b.cmp(a));
        let (x, y) = (3i32, 7i32);
        let ord = unsafe {
            caps.compare(
                &x as *const i32 as *const u8,
                &y as *const i32 as *const u8,
            )
        };
        assert_eq!(ord, Ordering::Greater);
    }

    #[test]
    fn drop_hook_runs_per_element() {
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let caps = PayloadCaps::of::<Tracked>();
        assert!(caps.needs_drop());

        let mut slots = [Tracked, Tracked, Tracked];
        unsafe { caps.drop_in_place(slots.as_mut_ptr() as *mut u8, 3) };
        std::mem::forget(slots);

        assert_eq!(DROPS.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn trivially_destructible_has_no_hook() {
        let caps = PayloadCaps::of::<[u8; 16]>();
        assert!(!caps.needs_drop());
        // A null run is fine: the call is a no-op.
        unsafe { caps.drop_in_place(std::ptr::null_mut(), 0) };
    }
}
