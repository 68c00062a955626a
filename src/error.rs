//! # Error Taxonomy
//!
//! Every fallible operation in this crate reports failure through its return
//! value as an [`eyre::Report`] carrying a [`TreeError`]. Callers that need
//! to dispatch on the failure kind downcast the report:
//!
//! ```ignore
//! match tree.insert(42, "answer") {
//!     Ok(()) => {}
//!     Err(report) => match report.downcast_ref::<TreeError>() {
//!         Some(TreeError::DuplicateKey) => { /* already present */ }
//!         _ => return Err(report),
//!     },
//! }
//! ```
//!
//! ## Last-Error Slot
//!
//! A thread-local slot records the kind of the most recent failure raised on
//! the calling thread. This is a purely diagnostic channel for debuggers and
//! logging shims layered above the crate; the return value is always the
//! primary channel. The slot is written by the same macro that raises the
//! error, so the two can never disagree.

use std::cell::Cell;

/// The failure taxonomy of the tree engine and its memory subsystem.
///
/// Variants carry enough context to print a useful message; the discriminant
/// alone is what callers dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    /// A required reference was absent.
    NullPointer,
    /// Construction degree outside the accepted range.
    InvalidDegree(usize),
    /// The slab pool (and fallback, where one applies) returned nothing.
    MemoryAllocation,
    /// Search or delete on a key the tree does not hold.
    KeyNotFound,
    /// Insert of an existing key while duplicates are disallowed.
    DuplicateKey,
    /// A precondition was violated; the payload names which one.
    InvalidOperation(&'static str),
    /// A capability distinct from the one the tree was built with was
    /// supplied to a call that takes one.
    TypeMismatch,
    /// A capability reported a zero payload size, or a pool was configured
    /// with an unusable size.
    InvalidSize,
    /// A capability alignment that is not a power of two or exceeds the
    /// slab block alignment.
    AlignmentError(usize),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::NullPointer => write!(f, "null pointer"),
            TreeError::InvalidDegree(d) => {
                write!(
                    f,
                    "invalid degree {} (must be in {}..={})",
                    d,
                    crate::config::MIN_DEGREE,
                    crate::config::MAX_DEGREE
                )
            }
            TreeError::MemoryAllocation => write!(f, "memory allocation failed"),
            TreeError::KeyNotFound => write!(f, "key not found"),
            TreeError::DuplicateKey => write!(f, "duplicate key"),
            TreeError::InvalidOperation(what) => write!(f, "invalid operation: {}", what),
            TreeError::TypeMismatch => write!(f, "type mismatch"),
            TreeError::InvalidSize => write!(f, "invalid size"),
            TreeError::AlignmentError(a) => write!(f, "alignment error: {}", a),
        }
    }
}

impl std::error::Error for TreeError {}

thread_local! {
    static LAST_ERROR: Cell<Option<TreeError>> = const { Cell::new(None) };
}

/// Returns the kind of the most recent failure raised on this thread, if any.
pub fn last_error() -> Option<TreeError> {
    LAST_ERROR.with(|slot| slot.get())
}

/// Clears the thread-local last-error slot.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.set(None));
}

pub(crate) fn record_last_error(err: TreeError) {
    LAST_ERROR.with(|slot| slot.set(Some(err)));
}
