//! Deterministic simulation infrastructure.
//!
//! Provides an in-memory page store with seeded fault injection so the tree
//! can be exercised without touching the filesystem, and so I/O failures can
//! be reproduced exactly from a seed.
//!
//! # Usage
//!
//! ```
//! use pagetree::btree::Tree;
//! use pagetree::simulation::{FaultConfig, SimulatedPageStore};
//!
//! let store = SimulatedPageStore::with_config(12345, FaultConfig::no_faults());
//! let mut tree = Tree::create(store, "demo")?;
//! tree.insert(b"key", b"value")?;
//! assert_eq!(tree.get(b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), pagetree::btree::BTreeError>(())
//! ```

mod storage;

pub use storage::{FaultConfig, SimulatedPageStore, SimulatedStorageStats};
