//! Bidirectional cursor over the entries of a tree.
//!
//! A crawler keeps the path from the root to its current leaf: one frame per
//! internal node holding that node's children in order and the index of the
//! child being visited, plus a snapshot of the current leaf's entries sorted
//! by key. Moving past the end of a leaf climbs to the deepest ancestor that
//! still has a sibling in that direction and descends along its edge.
//!
//! The crawler borrows the tree mutably, so the tree cannot change while a
//! crawl is in progress.

use crate::btree::node::{ChildEntry, LeafEntry, LeafNode, Node};
use crate::btree::overflow::read_overflow_value;
use crate::btree::tree::{BTreeError, Tree};
use crate::storage::{PageId, PageStore};

/// One internal node on the crawler's path.
struct InternalFrame {
    children: Vec<ChildEntry>,
    index: usize,
}

/// The leaf the crawler is positioned in.
struct LeafFrame {
    page: PageId,
    node: LeafNode,
    entries: Vec<LeafEntry>,
    index: usize,
}

#[derive(Clone, Copy)]
enum Edge {
    First,
    Last,
}

/// Cursor for in-order and reverse-order traversal.
pub struct Crawler<'a, S: PageStore> {
    store: &'a mut S,
    path: Vec<InternalFrame>,
    leaf: Option<LeafFrame>,
}

impl<'a, S: PageStore> Crawler<'a, S> {
    /// Position on the smallest entry of `tree`.
    pub fn first(tree: &'a mut Tree<S>) -> Result<Self, BTreeError> {
        Self::at_edge(tree, Edge::First)
    }

    /// Position on the largest entry of `tree`.
    pub fn last(tree: &'a mut Tree<S>) -> Result<Self, BTreeError> {
        Self::at_edge(tree, Edge::Last)
    }

    /// Position on the first entry whose key is `>= key`.
    ///
    /// If every key is smaller the crawler is exhausted and `key_value`
    /// returns `None`.
    pub fn seek(tree: &'a mut Tree<S>, key: &[u8]) -> Result<Self, BTreeError> {
        let (store, root) = tree.store_and_root();
        let mut crawler = Self {
            store,
            path: Vec::new(),
            leaf: None,
        };
        if root == 0 {
            return Ok(crawler);
        }

        // Children whose separator equals `key` may be preceded by a sibling
        // that also holds `key`, so route by the rightmost separator < key.
        let mut page = root;
        loop {
            match crawler.read_node(page)? {
                Node::Internal(node) => {
                    let children = node.children();
                    if children.is_empty() {
                        return Err(BTreeError::Corrupt(format!(
                            "internal node {page} has no children"
                        )));
                    }
                    let index = children
                        .partition_point(|child| child.key.as_slice() < key)
                        .saturating_sub(1);
                    let next = children[index].page;
                    crawler.path.push(InternalFrame {
                        children,
                        index,
                    });
                    page = next;
                }
                Node::Leaf(node) => {
                    let entries = node.entries();
                    let index = entries.partition_point(|entry| entry.key.as_slice() < key);
                    let past_end = index >= entries.len();
                    crawler.leaf = Some(LeafFrame {
                        page,
                        node,
                        index: index.min(entries.len().saturating_sub(1)),
                        entries,
                    });
                    if past_end && !crawler.next()? {
                        crawler.path.clear();
                        crawler.leaf = None;
                    }
                    return Ok(crawler);
                }
                Node::Overflow(_) => {
                    return Err(BTreeError::Corrupt(format!(
                        "overflow segment {page} linked as a tree node"
                    )));
                }
            }
        }
    }

    fn at_edge(tree: &'a mut Tree<S>, edge: Edge) -> Result<Self, BTreeError> {
        let (store, root) = tree.store_and_root();
        let mut crawler = Self {
            store,
            path: Vec::new(),
            leaf: None,
        };
        if root != 0 {
            crawler.descend_edge(root, edge)?;
        }
        Ok(crawler)
    }

    /// Whether the crawler is positioned on an entry.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.leaf
            .as_ref()
            .is_some_and(|leaf| leaf.index < leaf.entries.len())
    }

    /// Key at the current position.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        let leaf = self.leaf.as_ref()?;
        leaf.entries.get(leaf.index).map(|entry| entry.key.as_slice())
    }

    /// Page of the current leaf.
    #[must_use]
    pub fn leaf_page(&self) -> Option<PageId> {
        self.leaf.as_ref().map(|leaf| leaf.page)
    }

    /// Key and full value at the current position.
    ///
    /// Overflowed values are read back from their segment chain.
    pub fn key_value(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BTreeError> {
        let Some(leaf) = self.leaf.as_ref() else {
            return Ok(None);
        };
        let Some(entry) = leaf.entries.get(leaf.index) else {
            return Ok(None);
        };

        if leaf.node.has_overflow() {
            let value = read_overflow_value(self.store, &leaf.node)?;
            return Ok(Some((entry.key.clone(), value)));
        }
        Ok(Some((entry.key.clone(), entry.value.clone())))
    }

    /// Advance to the next entry in key order.
    ///
    /// Returns `false`, leaving the position unchanged, when already on the
    /// last entry.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool, BTreeError> {
        let Some(leaf) = self.leaf.as_mut() else {
            return Ok(false);
        };
        if leaf.index + 1 < leaf.entries.len() {
            leaf.index += 1;
            return Ok(true);
        }

        let Some(level) = self
            .path
            .iter()
            .rposition(|frame| frame.index + 1 < frame.children.len())
        else {
            return Ok(false);
        };

        self.path.truncate(level + 1);
        let frame = &mut self.path[level];
        frame.index += 1;
        let child = frame.children[frame.index].page;
        self.descend_edge(child, Edge::First)?;
        Ok(true)
    }

    /// Step back to the previous entry in key order.
    ///
    /// Returns `false`, leaving the position unchanged, when already on the
    /// first entry.
    pub fn previous(&mut self) -> Result<bool, BTreeError> {
        let Some(leaf) = self.leaf.as_mut() else {
            return Ok(false);
        };
        if leaf.index > 0 {
            leaf.index -= 1;
            return Ok(true);
        }

        let Some(level) = self.path.iter().rposition(|frame| frame.index > 0) else {
            return Ok(false);
        };

        self.path.truncate(level + 1);
        let frame = &mut self.path[level];
        frame.index -= 1;
        let child = frame.children[frame.index].page;
        self.descend_edge(child, Edge::Last)?;
        Ok(true)
    }

    fn read_node(&mut self, page: PageId) -> Result<Node, BTreeError> {
        if self.path.len() as u64 > self.store.total_pages() {
            return Err(BTreeError::Corrupt(format!(
                "crawl descended more than {} levels",
                self.store.total_pages()
            )));
        }
        Ok(Node::from_page(self.store.read(page)?)?)
    }

    /// Follow first or last children from `page` down to a leaf.
    fn descend_edge(&mut self, mut page: PageId, edge: Edge) -> Result<(), BTreeError> {
        loop {
            match self.read_node(page)? {
                Node::Internal(node) => {
                    let children = node.children();
                    let index = match edge {
                        Edge::First => 0,
                        Edge::Last => children.len().checked_sub(1).ok_or_else(|| {
                            BTreeError::Corrupt(format!("internal node {page} has no children"))
                        })?,
                    };
                    let next = children
                        .get(index)
                        .map(|child| child.page)
                        .ok_or_else(|| {
                            BTreeError::Corrupt(format!("internal node {page} has no children"))
                        })?;
                    self.path.push(InternalFrame {
                        children,
                        index,
                    });
                    page = next;
                }
                Node::Leaf(node) => {
                    let entries = node.entries();
                    let index = match edge {
                        Edge::First => 0,
                        Edge::Last => entries.len().saturating_sub(1),
                    };
                    self.leaf = Some(LeafFrame {
                        page,
                        node,
                        entries,
                        index,
                    });
                    return Ok(());
                }
                Node::Overflow(_) => {
                    return Err(BTreeError::Corrupt(format!(
                        "overflow segment {page} linked as a tree node"
                    )));
                }
            }
        }
    }
}
