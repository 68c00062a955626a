//! # End-to-End Tree Scenarios
//!
//! This module exercises the tree through its public API, end to end:
//!
//! 1. Small workloads
//!    - Tiny insert/search with splits
//!    - Duplicate rejection
//!    - Descending inserts (splits on the left spine)
//!
//! 2. Large workloads
//!    - Randomized insert/search/delete round-trip
//!    - Invariant verification at checkpoints
//!
//! 3. Resource discipline
//!    - Payload destructors on clear
//!    - Allocation-failure atomicity
//!    - Node reclamation over insert/delete cycles

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use slabtree::{BTree, PoolFlags, SlabPool, TreeError};

const POOL_SIZE: usize = 1024 * 1024;

// ============================================================================
// Small workloads
// ============================================================================

#[test]
fn tiny_insert_search_iterate() {
    let mut tree: BTree<i64, i64> = BTree::builder().degree(3).build().unwrap();
    for (k, v) in [(1, 10), (2, 20), (3, 30), (4, 40), (5, 50), (6, 60), (7, 70)] {
        tree.insert(k, v).unwrap();
    }

    assert_eq!(tree.len(), 7);
    assert_eq!(tree.height(), 2);
    // One root split on the way: root plus two leaves.
    assert_eq!(tree.stats().node_count, 3);
    assert_eq!(tree.get(&4), Some(&40));

    let keys: Vec<i64> = tree.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, (1..=7).collect::<Vec<i64>>());
    tree.check_invariants().unwrap();
}

#[test]
fn duplicate_key_leaves_first_value_in_place() {
    let mut tree: BTree<i64, i64> = BTree::builder().degree(5).build().unwrap();

    tree.insert(42, 1).unwrap();
    let err = tree.insert(42, 2).unwrap_err();
    assert_eq!(
        err.downcast_ref::<TreeError>(),
        Some(&TreeError::DuplicateKey)
    );
    assert_eq!(tree.get(&42), Some(&1));
    assert_eq!(tree.len(), 1);
}

#[test]
fn descending_inserts_split_on_the_left_spine() {
    let mut tree: BTree<i64, i64> = BTree::builder().degree(3).build().unwrap();
    for k in (1..=10).rev() {
        tree.insert(k, k).unwrap();
        tree.check_invariants().unwrap();
    }

    let keys: Vec<i64> = tree.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, (1..=10).collect::<Vec<i64>>());
    // Ten keys at degree 3 fit a two-level tree; every level obeys the
    // occupancy bounds, which the verifier just confirmed.
    assert_eq!(tree.height(), 2);
}

#[test]
fn interleaved_deletes_keep_the_tree_balanced() {
    let mut tree: BTree<i64, i64> = BTree::builder().degree(3).build().unwrap();
    for k in 1..=64 {
        tree.insert(k, k * 10).unwrap();
    }

    // Deleting separators forces predecessor/successor replacement and
    // merges; deleting runs forces rotations.
    for k in (1..=64).step_by(3) {
        tree.delete(&k).unwrap();
        tree.check_invariants().unwrap();
    }
    for k in 1..=64 {
        let expected = k % 3 != 1;
        assert_eq!(tree.contains(&k), expected, "key {}", k);
    }
}

#[test]
fn delete_down_to_empty_and_reuse() {
    let mut tree: BTree<i64, i64> = BTree::builder().degree(3).build().unwrap();
    for k in 1..=50 {
        tree.insert(k, k).unwrap();
    }
    for k in 1..=50 {
        tree.delete(&k).unwrap();
        tree.check_invariants().unwrap();
    }

    assert!(tree.is_empty());
    assert_eq!(tree.height(), 0);
    assert_eq!(tree.stats().node_count, 0);

    tree.insert(99, 99).unwrap();
    assert_eq!(tree.get(&99), Some(&99));
}

// ============================================================================
// Large workloads
// ============================================================================

#[test]
fn random_workload_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut keys: Vec<u32> = Vec::with_capacity(10_000);
    let mut seen = std::collections::HashSet::new();
    while keys.len() < 10_000 {
        let k: u32 = rng.gen();
        if seen.insert(k) {
            keys.push(k);
        }
    }

    let mut tree: BTree<u32, u32> = BTree::builder().degree(16).build().unwrap();
    for &k in &keys {
        tree.insert(k, k).unwrap();
    }
    assert_eq!(tree.len(), 10_000);
    tree.check_invariants().unwrap();
    for &k in &keys {
        assert_eq!(tree.get(&k), Some(&k));
    }

    let mut victims = keys.clone();
    victims.shuffle(&mut rng);
    let (dead, alive) = victims.split_at(5_000);
    for k in dead {
        tree.delete(k).unwrap();
    }

    assert_eq!(tree.len(), 5_000);
    tree.check_invariants().unwrap();
    for k in alive {
        assert_eq!(tree.get(k), Some(k), "surviving key {}", k);
    }
    for k in dead {
        let err = tree.delete(k).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TreeError>(),
            Some(&TreeError::KeyNotFound)
        );
    }
}

#[test]
fn iteration_reproduces_into_a_fresh_tree() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut keys: Vec<i64> = (0..500).map(|_| rng.gen_range(0..1_000_000)).collect();
    keys.sort_unstable();
    keys.dedup();

    let mut tree: BTree<i64, i64> = BTree::builder().degree(4).build().unwrap();
    for &k in &keys {
        tree.insert(k, k * 2).unwrap();
    }

    let mut copy: BTree<i64, i64> = BTree::builder().degree(4).build().unwrap();
    for (k, v) in tree.iter() {
        copy.insert(*k, *v).unwrap();
    }

    assert_eq!(copy.len(), tree.len());
    let original: Vec<(i64, i64)> = tree.iter().map(|(k, v)| (*k, *v)).collect();
    let replayed: Vec<(i64, i64)> = copy.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(original, replayed);
}

#[test]
fn bulk_load_reproduces_the_input_sequence() {
    let pairs: Vec<(i64, i64)> = (0..1_000).map(|k| (k, k * 7)).collect();

    let mut tree: BTree<i64, i64> = BTree::builder().degree(3).build().unwrap();
    tree.bulk_insert(pairs.clone()).unwrap();

    assert_eq!(tree.len(), 1_000);
    tree.check_invariants().unwrap();
    let walked: Vec<(i64, i64)> = tree.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(walked, pairs);

    // Bulk-loaded trees accept ordinary mutation afterwards.
    tree.delete(&500).unwrap();
    tree.insert(500, 3500).unwrap();
    assert_eq!(tree.get(&500), Some(&3500));
    tree.check_invariants().unwrap();
}

#[test]
fn range_search_respects_bounds_and_cap() {
    let mut tree: BTree<i64, i64> = BTree::builder().degree(8).build().unwrap();
    for k in 0..1_000 {
        tree.insert(k, k).unwrap();
    }

    let hits = tree.range_search(&100, &199, usize::MAX);
    assert_eq!(hits.len(), 100);
    assert_eq!(*hits[0].0, 100);
    assert_eq!(*hits[99].0, 199);

    let capped = tree.range_search(&100, &199, 10);
    assert_eq!(capped.len(), 10);
    assert_eq!(*capped[9].0, 109);
}

// ============================================================================
// Resource discipline
// ============================================================================

/// A value whose destructor bumps a shared counter.
struct Tracked {
    _payload: String,
    drops: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn clear_runs_every_destructor_and_releases_blocks() {
    let pool = SlabPool::create(512, POOL_SIZE, PoolFlags::TRACK_STATS).unwrap();
    let drops = Arc::new(AtomicUsize::new(0));

    let mut tree: BTree<i64, Tracked> = BTree::builder()
        .degree(4)
        .pool(pool.clone())
        .build()
        .unwrap();
    for k in 0..1_000 {
        tree.insert(
            k,
            Tracked {
                _payload: format!("payload-{k}"),
                drops: Arc::clone(&drops),
            },
        )
        .unwrap();
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    tree.clear();

    assert_eq!(drops.load(Ordering::SeqCst), 1_000);
    assert_eq!(pool.used_blocks(), 0);
    assert_eq!(tree.len(), 0);
    assert_eq!(tree.height(), 0);
}

#[test]
fn delete_runs_destructors_exactly_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut tree: BTree<i64, Tracked> = BTree::builder().degree(3).build().unwrap();

    for k in 0..100 {
        tree.insert(
            k,
            Tracked {
                _payload: k.to_string(),
                drops: Arc::clone(&drops),
            },
        )
        .unwrap();
    }
    for k in 0..100 {
        tree.delete(&k).unwrap();
    }

    assert_eq!(drops.load(Ordering::SeqCst), 100);
    assert!(tree.is_empty());
}

#[test]
fn failed_insert_leaves_the_tree_and_pool_untouched() {
    let pool = SlabPool::create(4096, POOL_SIZE, PoolFlags::TRACK_STATS).unwrap();
    let mut tree: BTree<i64, i64> = BTree::builder()
        .degree(3)
        .pool(pool.clone())
        .build()
        .unwrap();

    // Fill the root leaf to capacity (2t - 1 = 5 keys); the next insert
    // must split and therefore allocate.
    for k in 1..=5 {
        tree.insert(k, k).unwrap();
    }
    let size_before = tree.len();
    let height_before = tree.height();
    let nodes_before = tree.stats().node_count;
    let used_before = pool.used_blocks();

    pool.inject_alloc_failures(1);
    let err = tree.insert(6, 6).unwrap_err();
    assert_eq!(
        err.downcast_ref::<TreeError>(),
        Some(&TreeError::MemoryAllocation)
    );

    assert_eq!(tree.len(), size_before);
    assert_eq!(tree.height(), height_before);
    assert_eq!(tree.stats().node_count, nodes_before);
    assert_eq!(pool.used_blocks(), used_before);
    tree.check_invariants().unwrap();

    pool.clear_alloc_failures();
    tree.insert(6, 6).unwrap();
    assert_eq!(tree.get(&6), Some(&6));
    assert_eq!(tree.height(), 2);
}

#[test]
fn insert_delete_cycles_do_not_leak_nodes() {
    let pool = SlabPool::create(4096, POOL_SIZE, PoolFlags::TRACK_STATS).unwrap();
    let mut tree: BTree<i64, i64> = BTree::builder()
        .degree(3)
        .pool(pool.clone())
        .build()
        .unwrap();

    for round in 0..10 {
        for k in 0..200 {
            tree.insert(k, k + round).unwrap();
        }
        for k in 0..200 {
            tree.delete(&k).unwrap();
        }
        assert_eq!(tree.stats().node_count, 0, "round {}", round);
        assert_eq!(pool.used_blocks(), 0, "round {}", round);
    }

    let stats = pool.stats();
    assert_eq!(stats.allocation_count, stats.deallocation_count);
}

#[test]
fn exhausted_pool_surfaces_memory_allocation() {
    // A pool this small holds 16 blocks of 4 KiB; degree-3 nodes fill it
    // quickly.
    let pool = SlabPool::create(4096, 64 * 1024, PoolFlags::NONE).unwrap();
    let mut tree: BTree<i64, i64> = BTree::builder()
        .degree(3)
        .pool(pool.clone())
        .build()
        .unwrap();

    let mut inserted = 0i64;
    let exhausted = loop {
        match tree.insert(inserted, inserted) {
            Ok(()) => inserted += 1,
            Err(err) => break err,
        }
    };
    assert_eq!(
        exhausted.downcast_ref::<TreeError>(),
        Some(&TreeError::MemoryAllocation)
    );
    assert_eq!(tree.len() as i64, inserted);
    tree.check_invariants().unwrap();

    // Freeing space by deleting lets inserts proceed again.
    for k in 0..inserted / 2 {
        tree.delete(&k).unwrap();
    }
    tree.insert(inserted, inserted).unwrap();
    tree.check_invariants().unwrap();
}
