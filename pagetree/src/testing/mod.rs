use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::btree::{BTreeError, Node, Tree};
use crate::simulation::{FaultConfig, SimulatedPageStore};
use crate::storage::{FilePageStore, PageId, PageStore};

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Path for a new test tree file.
///
/// Each call returns a unique path in the system temp directory. Any file
/// left there by a previous run is removed.
pub fn new_test_path() -> PathBuf {
    let temp_dir = std::env::temp_dir();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_name = format!("pagetree_test_{}_{}.db", std::process::id(), counter);
    let path = temp_dir.join(unique_name);

    // Remove if it exists from a previous run
    let _ = std::fs::remove_file(&path);

    path
}

/// Create a new file-backed test tree.
pub fn new_test_file_tree() -> Result<(Tree<FilePageStore>, PathBuf), BTreeError> {
    let path = new_test_path();
    let store = FilePageStore::create(&path)?;
    Ok((Tree::create(store, "test")?, path))
}

/// Create a new in-memory tree with no fault injection.
pub fn new_test_tree() -> Tree<SimulatedPageStore> {
    let store = SimulatedPageStore::with_config(7, FaultConfig::no_faults());
    Tree::create(store, "test").expect("create in-memory tree")
}

/// Big-endian key, so byte order matches numeric order.
pub const fn be_key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

/// Deterministic value of `len` bytes derived from `seed`.
#[allow(clippy::cast_possible_truncation)]
pub fn sized_value(seed: u32, len: usize) -> Vec<u8> {
    let bytes = seed.to_le_bytes();
    (0..len).map(|i| bytes[i % 4] ^ (i as u8)).collect()
}

/// Walk the whole tree checking its structural invariants and return every
/// key in leaf order.
///
/// Panics if leaf order is not sorted, a separator differs from the first
/// key beneath it, a parent pointer is wrong, or a node is empty.
pub fn check_tree<S: PageStore>(tree: &mut Tree<S>) -> Vec<Vec<u8>> {
    let root = tree.root();
    let mut keys = Vec::new();
    if root != 0 {
        walk(tree.store_mut(), root, 0, &mut keys);
    }
    assert!(
        keys.windows(2).all(|pair| pair[0] <= pair[1]),
        "leaf order is not sorted"
    );
    keys
}

/// Returns the first key in the subtree at `page`.
fn walk<S: PageStore>(
    store: &mut S,
    page: PageId,
    expected_parent: PageId,
    keys: &mut Vec<Vec<u8>>,
) -> Vec<u8> {
    let node = Node::from_page(store.read(page).expect("read node")).expect("decode node");
    match node {
        Node::Leaf(leaf) => {
            assert_eq!(leaf.parent(), expected_parent, "leaf {page} has a stale parent");
            let entries = leaf.entries();
            assert!(!entries.is_empty(), "leaf {page} is empty");
            let first = entries[0].key.clone();
            keys.extend(entries.into_iter().map(|entry| entry.key));
            first
        }
        Node::Internal(internal) => {
            assert_eq!(
                internal.parent(),
                expected_parent,
                "internal node {page} has a stale parent"
            );
            let children = internal.children();
            assert!(!children.is_empty(), "internal node {page} is empty");
            for child in &children {
                let first = walk(store, child.page, page, keys);
                assert_eq!(first, child.key, "separator for page {} is stale", child.page);
            }
            children[0].key.clone()
        }
        Node::Overflow(_) => panic!("overflow segment {page} linked as a tree node"),
    }
}
