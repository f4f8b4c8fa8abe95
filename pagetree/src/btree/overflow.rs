//! Overflow chains for values too large to fit in one leaf.
//!
//! An overflowed leaf holds a single entry: the key and the first part of
//! the value. The rest of the value is stored in a singly linked chain of
//! overflow segments starting at the leaf's overflow pointer.
//!
//! ```text
//! +--------------------+     +-------------+     +-------------+
//! | leaf               | --> | segment 1   | --> | segment 2   | --> none
//! | key | value prefix |     | 4082 bytes  |     | <= 4082     |
//! +--------------------+     +-------------+     +-------------+
//! ```
//!
//! Segments are allocated last-to-first so that every segment already knows
//! its successor's page when it is first written.

use crate::btree::node::{LeafNode, NodeError, OverflowSegment};
use crate::storage::{PageId, PageStore, StorageError};

/// Write an overflowed leaf and its segment chain.
///
/// Returns the page of the new leaf.
pub fn write_overflow_leaf<S: PageStore>(
    store: &mut S,
    parent: PageId,
    key: &[u8],
    value: &[u8],
) -> Result<PageId, OverflowError> {
    let (mut leaf, segments) = LeafNode::with_overflow(parent, key, value)?;

    let mut next = None;
    for mut segment in segments.into_iter().rev() {
        segment.set_next(next);
        next = Some(store.allocate(segment.page())?);
    }

    leaf.set_overflow_page(next);
    let leaf_page = store.allocate(leaf.page())?;

    tracing::debug!(
        leaf_page,
        first_segment = ?next,
        value_len = value.len(),
        "wrote overflow chain"
    );
    Ok(leaf_page)
}

/// Reassemble the full value of an overflowed leaf.
///
/// For a leaf without an overflow pointer this is just the inline value.
pub fn read_overflow_value<S: PageStore>(
    store: &mut S,
    leaf: &LeafNode,
) -> Result<Vec<u8>, OverflowError> {
    let mut value = leaf
        .entries()
        .into_iter()
        .next()
        .map(|entry| entry.value)
        .unwrap_or_default();

    let Some(start) = leaf.overflow_page() else {
        return Ok(value);
    };

    // A well-formed chain visits each page at most once.
    let max_hops = store.total_pages();
    let mut hops = 0;
    let mut current = Some(start);
    while let Some(page_id) = current {
        hops += 1;
        if hops > max_hops {
            return Err(OverflowError::ChainTooLong { start });
        }
        let segment = OverflowSegment::from_page(store.read(page_id)?)?;
        value.extend_from_slice(segment.data());
        current = segment.next();
    }

    Ok(value)
}

/// Errors related to overflow chains.
#[derive(Debug)]
pub enum OverflowError {
    /// Page store error.
    Storage(StorageError),
    /// A page in the chain is not a valid segment.
    Node(NodeError),
    /// The chain revisits pages.
    ChainTooLong { start: PageId },
}

impl std::fmt::Display for OverflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::ChainTooLong { start } => {
                write!(f, "overflow chain starting at page {start} does not terminate")
            }
        }
    }
}

impl std::error::Error for OverflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::ChainTooLong { .. } => None,
        }
    }
}

impl From<StorageError> for OverflowError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NodeError> for OverflowError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}
