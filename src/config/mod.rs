//! # Configuration Module
//!
//! This module centralizes all configuration constants for the tree and its
//! memory subsystem. Constants are grouped by their functional area and
//! interdependencies are documented and enforced through compile-time
//! assertions.
//!
//! ## Why Centralization?
//!
//! The degree bounds, slab block alignment, and pool size limits all feed
//! into each other: a node block must fit into a pool, a pool must hold at
//! least one block, and every block must start on a cache line. By
//! co-locating these values and adding compile-time checks, mismatches are
//! caught at build time rather than as corrupted trees.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
