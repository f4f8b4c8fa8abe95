//! Page-based B-tree.
//!
//! ## Page layout
//!
//! ```text
//! page 0        header: root page, tree name, node size limits
//! page 1..N     internal nodes, leaves, overflow segments
//! ```
//!
//! Internal nodes map separator keys to child pages. A separator is the
//! smallest key stored beneath its child. Leaves hold key-value pairs in
//! insertion order; readers sort them. A value too large for one leaf lives
//! in a leaf of its own whose tail continues through a chain of overflow
//! segments.
//!
//! ## Usage
//!
//! ```
//! use pagetree::btree::Tree;
//! use pagetree::simulation::SimulatedPageStore;
//!
//! let mut tree = Tree::create(SimulatedPageStore::new(1), "people")?;
//! tree.insert(b"ada", b"lovelace")?;
//! tree.insert(b"alan", b"turing")?;
//!
//! let mut crawler = tree.crawl_from(b"al")?;
//! assert_eq!(crawler.key(), Some(&b"alan"[..]));
//! assert!(crawler.previous()?);
//! assert_eq!(crawler.key_value()?, Some((b"ada".to_vec(), b"lovelace".to_vec())));
//! # Ok::<(), pagetree::btree::BTreeError>(())
//! ```

mod crawler;
mod header;
mod node;
mod overflow;
mod tree;

#[cfg(test)]
mod tests;

pub use crawler::Crawler;
pub use header::{DEFAULT_TREE_NAME, HeaderError, MAX_NAME_LEN, TreeHeader};
pub use node::{
    ChildEntry, ENTRY_OVERHEAD, INTERNAL_CAPACITY, InternalNode, LEAF_CAPACITY, LeafEntry,
    LeafNode, Node, NodeError, NodeHeader, NodeKind, OverflowSegment, SEGMENT_CAPACITY,
};
pub use overflow::{OverflowError, read_overflow_value, write_overflow_leaf};
pub use tree::{BTreeError, LeafPath, MAX_KEY_SIZE, Tree, TreeStats};
