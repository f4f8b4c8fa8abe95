//! Randomized tests comparing the tree against an in-memory model, and runs
//! under injected storage faults.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{BTreeError, Tree};
use crate::simulation::{FaultConfig, SimulatedPageStore};
use crate::storage::StorageError;
use crate::testing::{be_key, check_tree, new_test_tree, sized_value};

#[derive(Debug, Clone)]
enum ModelOp {
    Insert(u16, u32, usize),
    Delete(u16),
    Update(u16, u32, usize),
}

fn value_len_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![
        8 => 0usize..600,
        1 => 4_000usize..12_000,
    ]
}

fn op_strategy() -> impl Strategy<Value = ModelOp> {
    let key_range = 0u16..48;
    prop_oneof![
        6 => (key_range.clone(), any::<u32>(), value_len_strategy())
            .prop_map(|(k, seed, len)| ModelOp::Insert(k, seed, len)),
        2 => key_range.clone().prop_map(ModelOp::Delete),
        1 => (key_range, any::<u32>(), value_len_strategy())
            .prop_map(|(k, seed, len)| ModelOp::Update(k, seed, len)),
    ]
}

/// Apply `ops` to both a tree and a multimap model.
fn run_ops(ops: Vec<ModelOp>) -> (Tree<SimulatedPageStore>, BTreeMap<Vec<u8>, Vec<Vec<u8>>>) {
    let mut tree = new_test_tree();
    let mut model: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();

    for op in ops {
        match op {
            ModelOp::Insert(key, seed, len) => {
                let key = key.to_be_bytes().to_vec();
                let value = sized_value(seed, len);
                tree.insert(&key, &value).expect("insert");
                model.entry(key).or_default().push(value);
            }
            ModelOp::Delete(key) => {
                let key = key.to_be_bytes().to_vec();
                let expected = model.remove(&key).map_or(0, |values| values.len());
                assert_eq!(tree.delete(&key).expect("delete"), expected);
            }
            ModelOp::Update(key, seed, len) => {
                let key = key.to_be_bytes().to_vec();
                let value = sized_value(seed, len);
                tree.update(&key, &value).expect("update");
                model.insert(key, vec![value]);
            }
        }
    }

    (tree, model)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn tree_matches_model_random_ops(ops in prop::collection::vec(op_strategy(), 1..160)) {
        let (mut tree, model) = run_ops(ops);

        let expected_keys: Vec<Vec<u8>> = model
            .iter()
            .flat_map(|(key, values)| std::iter::repeat_n(key.clone(), values.len()))
            .collect();
        prop_assert_eq!(check_tree(&mut tree), expected_keys);

        for (key, values) in &model {
            let mut actual = tree.get_all(key).expect("get_all");
            actual.sort();
            let mut expected = values.clone();
            expected.sort();
            prop_assert_eq!(actual, expected);

            let first = tree.get(key).expect("get");
            prop_assert!(first.is_some_and(|value| values.contains(&value)));
        }

        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = tree.entries().expect("entries");
        entries.sort();
        let mut expected_entries: Vec<(Vec<u8>, Vec<u8>)> = model
            .into_iter()
            .flat_map(|(key, values)| values.into_iter().map(move |value| (key.clone(), value)))
            .collect();
        expected_entries.sort();
        prop_assert_eq!(entries, expected_entries);
    }

    #[test]
    fn crawl_from_matches_model(
        ops in prop::collection::vec(op_strategy(), 1..120),
        seek_key in 0u16..64,
    ) {
        let (mut tree, model) = run_ops(ops);
        let seek_key = seek_key.to_be_bytes();

        let expected = model.range(seek_key.to_vec()..).next().map(|(key, _)| key.clone());
        let crawler = tree.crawl_from(&seek_key).expect("seek");
        prop_assert_eq!(crawler.key().map(<[u8]>::to_vec), expected);
    }
}

#[test]
fn test_random_inserts_and_deletes_keep_structure() {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut tree = new_test_tree();
    let mut model: BTreeMap<u32, usize> = BTreeMap::new();

    for round in 0..3_000 {
        let key = rng.random_range(0..800u32);
        if rng.random::<f64>() < 0.7 {
            let len = rng.random_range(1..300);
            tree.insert(&be_key(key), &sized_value(key, len)).expect("insert");
            *model.entry(key).or_default() += 1;
        } else {
            let removed = tree.delete(&be_key(key)).expect("delete");
            assert_eq!(removed, model.remove(&key).unwrap_or(0), "round {round}");
        }
    }

    let total: usize = model.values().sum();
    assert_eq!(check_tree(&mut tree).len(), total);
    assert_eq!(tree.len().expect("len"), total);
}

#[test]
fn test_io_faults_surface_as_errors() {
    let store = SimulatedPageStore::with_config(99, FaultConfig::no_faults());
    let mut tree = Tree::create(store, "faulty").expect("create");
    tree.store_mut().set_fault_config(FaultConfig::io_errors(0.02));

    let mut failures = 0;
    for i in 0..1_000u32 {
        let result = if i % 5 == 0 {
            tree.delete(&be_key(i / 2)).map(|_| ())
        } else {
            tree.insert(&be_key(i), &sized_value(i, 150))
        };
        match result {
            Ok(()) => {}
            Err(BTreeError::Storage(StorageError::InjectedFault(_))) => failures += 1,
            // A failed write can leave a node pointing at stale pages.
            Err(BTreeError::Corrupt(_) | BTreeError::Node(_)) => failures += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert!(failures > 0, "2% fault rate over 1000 operations should fail");
    let stats = tree.store().stats();
    assert!(stats.injected_read_errors + stats.injected_write_errors > 0);
}

#[test]
fn test_corrupted_reads_never_panic() {
    let mut tree = new_test_tree();
    for i in 0..1_500u32 {
        tree.insert(&be_key(i), &sized_value(i, 90)).expect("insert");
    }
    tree.insert(b"blob", &sized_value(5, 20_000)).expect("insert");

    tree.store_mut().set_fault_config(FaultConfig {
        corruption_rate: 0.2,
        ..FaultConfig::no_faults()
    });

    let mut errors = 0;
    for i in 0..1_500u32 {
        if tree.get(&be_key(i)).is_err() {
            errors += 1;
        }
        if i % 100 == 0 && tree.get_all(b"blob").is_err() {
            errors += 1;
        }
    }
    assert!(errors > 0, "corrupted pages should be rejected");
    assert!(tree.store().stats().corrupted_reads > 0);
}
