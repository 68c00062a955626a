//! # Internal Macros
//!
//! This module provides internal macros for raising [`TreeError`] values.
//!
//! ## `tree_bail!` / `tree_ensure!`
//!
//! Thin wrappers over `eyre::bail!` that record the error kind in the
//! thread-local last-error slot before returning it, so the diagnostic
//! channel and the return value can never disagree.
//!
//! ### Usage
//!
//! ```ignore
//! tree_ensure!(degree >= MIN_DEGREE, TreeError::InvalidDegree(degree));
//! tree_bail!(TreeError::DuplicateKey);
//! ```
//!
//! [`TreeError`]: crate::error::TreeError

/// Records the error kind in the last-error slot, then bails with it.
macro_rules! tree_bail {
    ($err:expr) => {{
        let err: $crate::error::TreeError = $err;
        $crate::error::record_last_error(err);
        ::eyre::bail!(err)
    }};
}

/// Like `eyre::ensure!`, but routed through [`tree_bail!`].
macro_rules! tree_ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            tree_bail!($err);
        }
    };
}
