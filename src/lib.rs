//! # slabtree - Embedded Ordered Index
//!
//! slabtree is an in-memory ordered key-value index: a classic B-Tree of
//! configurable branching factor over slab-allocated nodes. It is built
//! to be embedded: a component other code links against to obtain a
//! sorted associative container with predictable structure and explicit
//! control over memory layout:
//!
//! - **Fixed-block node storage**: every node occupies one cache-aligned
//!   slab block; pools are shareable between trees
//! - **Index-based references**: parents and children refer to nodes by
//!   slab index, keeping the ownership graph acyclic
//! - **Logarithmic everything**: point insert, lookup, delete, and range
//!   positioning all visit O(height) nodes
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
//! for (key, value) in tree.iter() {
//!     println!("{key} -> {value}");
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Typed front-end (BTree)        │
//! ├─────────────────────────────────────┤
//! │  Capability (sizes, order, drop)    │
//! ├─────────────────────────────────────┤
//! │  Tree engine (split / fill / bulk)  │
//! ├──────────────────┬──────────────────┤
//! │   Node views     │     Cursors      │
//! ├──────────────────┴──────────────────┤
//! │   Slab pools + memory manager       │
//! └─────────────────────────────────────┘
//! ```
//!
//! User calls reach the tree engine, which uses the capability to order
//! and move payloads, asks the slab pool for node blocks, and on read
//! hands back references through the cursors.
//!
//! ## Concurrency Model
//!
//! Single writer, no concurrent readers: a tree instance is mutated
//! through `&mut self` and no operation suspends. Two trees may share a
//! slab pool; the pool guards its own free list. Iterators borrow the
//! tree, so the borrow checker rules out mutation underneath them.
//!
//! ## Error Handling
//!
//! Every fallible operation returns `eyre::Result`; the carried
//! [`TreeError`] names the failure kind (duplicate key, key not found,
//! allocation failure, ...). Mutators are all-or-nothing: a failed
//! insert or delete leaves the tree exactly as it was. Nothing is logged
//! and nothing is recovered silently.
//!
//! ## Module Overview
//!
//! - [`caps`]: key/value capability: sizes, comparator, destructor
//! - [`memory`]: slab pools and the size-classed memory manager
//! - [`tree`]: the engine proper: node layout, algorithms, cursors
//! - [`error`]: the failure taxonomy and the thread-local last-error slot
//! - [`config`]: centralized constants

#[macro_use]
mod macros;

pub mod caps;
pub mod config;
pub mod error;
mod map;
pub mod memory;
pub mod tree;

pub use caps::{PayloadCaps, TypeCaps};
pub use error::{clear_last_error, last_error, TreeError};
pub use map::{BTree, BTreeBuilder, Iter, Range};
pub use memory::{BlockId, ManagerStats, MemoryManager, PoolFlags, PoolStats, SlabPool};
pub use tree::{RawTree, TreeFlags, TreeStats};
