//! # Model-Based Property Tests
//!
//! Random operation sequences are replayed against `std::collections::
//! BTreeMap` as the reference model. After every sequence the tree must
//! agree with the model on membership, values, length, and iteration
//! order, and must pass the structural verifier.

use std::collections::BTreeMap;

use proptest::prelude::*;

use slabtree::{BTree, TreeError};

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u32),
    Delete(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u16>(), any::<u32>()).prop_map(|(k, v)| Op::Insert(k % 512, v)),
        any::<u16>().prop_map(|k| Op::Delete(k % 512)),
    ]
}

fn degrees() -> impl Strategy<Value = usize> {
    prop_oneof![Just(3usize), Just(4), Just(8), Just(16)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn tree_agrees_with_btreemap(degree in degrees(), ops in prop::collection::vec(op_strategy(), 1..400)) {
        let mut tree: BTree<u16, u32> = BTree::builder().degree(degree).build().unwrap();
        let mut model: BTreeMap<u16, u32> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let result = tree.insert(k, v);
                    if model.contains_key(&k) {
                        let err = result.unwrap_err();
                        prop_assert_eq!(
                            err.downcast_ref::<TreeError>(),
                            Some(&TreeError::DuplicateKey)
                        );
                    } else {
                        result.unwrap();
                        model.insert(k, v);
                    }
                }
                Op::Delete(k) => {
                    let result = tree.delete(&k);
                    if model.remove(&k).is_some() {
                        result.unwrap();
                    } else {
                        let err = result.unwrap_err();
                        prop_assert_eq!(
                            err.downcast_ref::<TreeError>(),
                            Some(&TreeError::KeyNotFound)
                        );
                    }
                }
            }
        }

        prop_assert_eq!(tree.len(), model.len());
        tree.check_invariants().unwrap();

        for (k, v) in &model {
            prop_assert_eq!(tree.get(k), Some(v));
        }

        let walked: Vec<(u16, u32)> = tree.iter().map(|(k, v)| (*k, *v)).collect();
        let expected: Vec<(u16, u32)> = model.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(walked, expected);
    }

    #[test]
    fn bulk_load_matches_incremental_build(degree in degrees(), keys in prop::collection::btree_set(any::<u16>(), 1..300)) {
        let pairs: Vec<(u16, u32)> = keys.iter().map(|&k| (k, k as u32 * 3)).collect();

        let mut bulk: BTree<u16, u32> = BTree::builder().degree(degree).build().unwrap();
        bulk.bulk_insert(pairs.clone()).unwrap();
        bulk.check_invariants().unwrap();

        let mut incremental: BTree<u16, u32> = BTree::builder().degree(degree).build().unwrap();
        for &(k, v) in &pairs {
            incremental.insert(k, v).unwrap();
        }

        prop_assert_eq!(bulk.len(), incremental.len());
        let a: Vec<(u16, u32)> = bulk.iter().map(|(k, v)| (*k, *v)).collect();
        let b: Vec<(u16, u32)> = incremental.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn range_matches_model(lo in any::<u16>(), hi in any::<u16>(), keys in prop::collection::btree_set(any::<u16>(), 0..200)) {
        let mut tree: BTree<u16, u16> = BTree::builder().degree(4).build().unwrap();
        let mut model: BTreeMap<u16, u16> = BTreeMap::new();
        for &k in &keys {
            tree.insert(k, k).unwrap();
            model.insert(k, k);
        }

        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let walked: Vec<u16> = tree.range(&lo, &hi, true, true).map(|(k, _)| *k).collect();
        let expected: Vec<u16> = model.range(lo..=hi).map(|(k, _)| *k).collect();
        prop_assert_eq!(walked, expected);
    }
}
