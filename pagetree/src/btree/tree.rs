//! Page-based B-tree over a `PageStore`.
//!
//! Keys and values are raw byte strings compared lexicographically. Keys are
//! not unique: the same key may be stored several times, in one leaf or
//! across neighbouring leaves.
//!
//! The tree keeps no pages in memory between calls. Every operation starts
//! from the root recorded in the header page, re-reads what it needs and
//! writes back every node it changes before returning.
//!
//! Values too large for one leaf are stored in an overflowed leaf followed by
//! a chain of overflow segments (see `overflow`).

use crate::btree::crawler::Crawler;
use crate::btree::header::{HeaderError, TreeHeader};
use crate::btree::node::{
    ChildEntry, InternalNode, LEAF_CAPACITY, LeafEntry, LeafNode, Node, NodeError,
    leaf_entry_size,
};
use crate::btree::overflow::{OverflowError, read_overflow_value, write_overflow_leaf};
use crate::storage::{HEADER_PAGE, PageId, PageStore, StorageError};

/// Maximum key length in bytes.
///
/// Bounded so that an internal node always holds at least three separators.
pub const MAX_KEY_SIZE: usize = 1024;

/// A B-tree backed by a page store.
pub struct Tree<S: PageStore> {
    store: S,
    header: TreeHeader,
}

/// A leaf together with the internal nodes above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPath {
    /// Page of the leaf.
    pub page: PageId,
    /// Internal node pages from the root down to the leaf's parent.
    pub ancestors: Vec<PageId>,
}

impl LeafPath {
    /// The leaf's parent page, or 0 when the leaf is the root.
    #[must_use]
    pub fn parent(&self) -> PageId {
        self.ancestors.last().copied().unwrap_or(0)
    }
}

/// Shape of a tree, gathered by walking every node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels, counting the leaf level. 0 for an empty tree.
    pub depth: usize,
    pub internal_nodes: usize,
    pub leaves: usize,
    /// Leaves whose value continues in overflow segments.
    pub overflow_leaves: usize,
    pub entries: usize,
    /// Pages held by the store, including the header and overflow segments.
    pub total_pages: u64,
}

/// Result of walking from the root to a leaf.
struct Descent {
    leaf: LeafNode,
    path: LeafPath,
    /// Whether every step took the last child, making this the last leaf.
    is_last: bool,
}

/// Index of the rightmost separator `<= key`.
fn route(children: &[ChildEntry], key: &[u8]) -> Option<usize> {
    children
        .partition_point(|child| child.key.as_slice() <= key)
        .checked_sub(1)
}

/// Indices of every child whose subtree may hold `key`: all children whose
/// separator equals `key`, plus the rightmost one whose separator is smaller.
fn fan_out(children: &[ChildEntry], key: &[u8]) -> std::ops::Range<usize> {
    let end = children.partition_point(|child| child.key.as_slice() <= key);
    if end == 0 {
        return 0..0;
    }
    let equal_start = children.partition_point(|child| child.key.as_slice() < key);
    equal_start.saturating_sub(1)..end
}

fn sort_entries(entries: &mut [LeafEntry]) {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
}

impl<S: PageStore> Tree<S> {
    /// Bootstrap a new tree in an empty store.
    ///
    /// Writes the header page (page 0) with an empty root.
    pub fn create(mut store: S, name: &str) -> Result<Self, BTreeError> {
        let total_pages = store.total_pages();
        if total_pages != 0 {
            return Err(BTreeError::StoreNotEmpty { total_pages });
        }

        let header = TreeHeader::new(name)?;
        store.write_header(&header.to_page())?;
        tracing::info!(name, "created tree");

        Ok(Self { store, header })
    }

    /// Open the tree whose header is in page 0 of `store`.
    pub fn open(mut store: S) -> Result<Self, BTreeError> {
        if store.total_pages() == 0 {
            return Err(BTreeError::MissingHeader);
        }

        let header = TreeHeader::from_page(&store.read(HEADER_PAGE)?)?;
        tracing::info!(name = %header.name, root = header.root, "opened tree");

        Ok(Self { store, header })
    }

    /// Open the tree in `store`, bootstrapping it if the store is empty.
    pub fn open_or_create(store: S, name: &str) -> Result<Self, BTreeError> {
        if store.total_pages() == 0 {
            Self::create(store, name)
        } else {
            Self::open(store)
        }
    }

    #[must_use]
    pub const fn header(&self) -> &TreeHeader {
        &self.header
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Page of the root node, or 0 for an empty tree.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.header.root
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consume the tree, returning its store.
    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Flush the store to durable storage.
    pub fn sync(&mut self) -> Result<(), BTreeError> {
        Ok(self.store.sync()?)
    }

    pub(crate) const fn store_and_root(&mut self) -> (&mut S, PageId) {
        (&mut self.store, self.header.root)
    }

    /// Look up the first value stored under `key`.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let Some(descent) = self.descend(key)? else {
            return Ok(None);
        };
        let leaf = descent.leaf;

        if leaf.has_overflow() {
            if leaf.first_key().as_deref() != Some(key) {
                return Ok(None);
            }
            return Ok(Some(read_overflow_value(&mut self.store, &leaf)?));
        }
        Ok(leaf.get(key))
    }

    /// Look up every value stored under `key`, in leaf order.
    pub fn get_all(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>, BTreeError> {
        let mut values = Vec::new();
        if self.header.is_empty() {
            return Ok(values);
        }

        let mut pending = vec![self.header.root];
        let mut visited = 0;
        while let Some(page_id) = pending.pop() {
            visited += 1;
            self.check_depth(visited)?;
            match self.read_node(page_id)? {
                Node::Internal(node) => {
                    let children = node.children();
                    for index in fan_out(&children, key).rev() {
                        pending.push(children[index].page);
                    }
                }
                Node::Leaf(leaf) if leaf.has_overflow() => {
                    if leaf.first_key().as_deref() == Some(key) {
                        values.push(read_overflow_value(&mut self.store, &leaf)?);
                    }
                }
                Node::Leaf(leaf) => values.extend(
                    leaf.entries()
                        .into_iter()
                        .filter(|entry| entry.key == key)
                        .map(|entry| entry.value),
                ),
                Node::Overflow(_) => {
                    return Err(BTreeError::Corrupt(format!(
                        "overflow segment {page_id} linked as a tree node"
                    )));
                }
            }
        }

        Ok(values)
    }

    /// Insert a key-value pair. Existing entries for the key are kept.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), BTreeError> {
        if key.len() > MAX_KEY_SIZE {
            return Err(BTreeError::KeyTooLarge {
                len: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        let oversized = leaf_entry_size(key.len(), value.len()) > LEAF_CAPACITY;

        let Some(descent) = self.descend(key)? else {
            let page = if oversized {
                write_overflow_leaf(&mut self.store, 0, key, value)?
            } else {
                let mut leaf = LeafNode::new(0);
                leaf.put_kv(key, value)?;
                self.store.allocate(leaf.page())?
            };
            return self.set_root(page);
        };

        if oversized {
            return self.insert_overflow(descent, key, value);
        }

        let Descent {
            mut leaf,
            path,
            is_last,
        } = descent;

        if leaf.fits(key.len(), value.len()) {
            let old_first = leaf.first_key();
            leaf.put_kv(key, value)?;
            self.store.write(path.page, leaf.page())?;
            return self.refresh_separator(&path, old_first.as_deref(), leaf.first_key());
        }

        if leaf.has_overflow() {
            return self.insert_beside_overflow_leaf(&path, &leaf, key, value);
        }

        self.split_leaf(&leaf, &path, is_last, key, value)
    }

    /// Replace every value stored under `key` with `value`.
    ///
    /// Implemented as a delete followed by an insert.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), BTreeError> {
        self.delete(key)?;
        self.insert(key, value)
    }

    /// Remove every entry stored under `key`, returning how many were
    /// removed.
    ///
    /// Underfull leaves are never merged. A leaf left empty is unlinked from
    /// its parent, and an empty root leaves the tree empty.
    pub fn delete(&mut self, key: &[u8]) -> Result<usize, BTreeError> {
        let mut removed = 0;

        while let Some(Descent { mut leaf, path, .. }) = self.descend(key)? {
            let old_first = leaf.first_key();
            let count = leaf.delete_kv_by_key(key);
            if count == 0 {
                break;
            }
            removed += count;

            if leaf.is_empty() {
                tracing::debug!(page = path.page, "unlinking empty leaf");
                self.relink(&path.ancestors, path.page, Vec::new())?;
            } else {
                self.store.write(path.page, leaf.page())?;
                self.refresh_separator(&path, old_first.as_deref(), leaf.first_key())?;
            }
        }

        Ok(removed)
    }

    /// Every leaf in key order, each with its ancestor pages.
    pub fn leaves(&mut self) -> Result<Vec<LeafPath>, BTreeError> {
        let mut leaves = Vec::new();
        if self.header.is_empty() {
            return Ok(leaves);
        }

        let mut pending = vec![LeafPath {
            page: self.header.root,
            ancestors: Vec::new(),
        }];
        while let Some(path) = pending.pop() {
            self.check_depth(path.ancestors.len())?;
            match self.read_node(path.page)? {
                Node::Leaf(_) => leaves.push(path),
                Node::Internal(node) => {
                    let mut ancestors = path.ancestors;
                    ancestors.push(path.page);
                    for child in node.children().into_iter().rev() {
                        pending.push(LeafPath {
                            page: child.page,
                            ancestors: ancestors.clone(),
                        });
                    }
                }
                Node::Overflow(_) => {
                    return Err(BTreeError::Corrupt(format!(
                        "overflow segment {} linked as a tree node",
                        path.page
                    )));
                }
            }
        }

        Ok(leaves)
    }

    /// Walk every node and report the tree's shape.
    pub fn stats(&mut self) -> Result<TreeStats, BTreeError> {
        let mut stats = TreeStats {
            total_pages: self.store.total_pages(),
            ..TreeStats::default()
        };
        if self.header.is_empty() {
            return Ok(stats);
        }

        let mut pending = vec![(self.header.root, 1)];
        while let Some((page_id, level)) = pending.pop() {
            self.check_depth(level)?;
            stats.depth = stats.depth.max(level);
            match self.read_node(page_id)? {
                Node::Internal(node) => {
                    stats.internal_nodes += 1;
                    pending.extend(node.children().into_iter().map(|c| (c.page, level + 1)));
                }
                Node::Leaf(leaf) => {
                    stats.leaves += 1;
                    stats.entries += leaf.len();
                    if leaf.has_overflow() {
                        stats.overflow_leaves += 1;
                    }
                }
                Node::Overflow(_) => {
                    return Err(BTreeError::Corrupt(format!(
                        "overflow segment {page_id} linked as a tree node"
                    )));
                }
            }
        }

        Ok(stats)
    }

    /// Number of entries in the tree.
    pub fn len(&mut self) -> Result<usize, BTreeError> {
        Ok(self.stats()?.entries)
    }

    /// Number of levels, counting the leaf level. 0 for an empty tree.
    pub fn depth(&mut self) -> Result<usize, BTreeError> {
        Ok(self.stats()?.depth)
    }

    /// Every entry in key order, with overflowed values reassembled.
    pub fn entries(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BTreeError> {
        let mut crawler = Crawler::first(self)?;
        let mut entries = Vec::new();
        while let Some(entry) = crawler.key_value()? {
            entries.push(entry);
            if !crawler.next()? {
                break;
            }
        }
        Ok(entries)
    }

    /// Position a crawler on the first entry.
    pub fn crawl_first(&mut self) -> Result<Crawler<'_, S>, BTreeError> {
        Crawler::first(self)
    }

    /// Position a crawler on the last entry.
    pub fn crawl_last(&mut self) -> Result<Crawler<'_, S>, BTreeError> {
        Crawler::last(self)
    }

    /// Position a crawler on the first entry whose key is `>= key`.
    pub fn crawl_from(&mut self, key: &[u8]) -> Result<Crawler<'_, S>, BTreeError> {
        Crawler::seek(self, key)
    }

    fn read_node(&mut self, page_id: PageId) -> Result<Node, BTreeError> {
        Ok(Node::from_page(self.store.read(page_id)?)?)
    }

    fn read_leaf(&mut self, page_id: PageId) -> Result<LeafNode, BTreeError> {
        Ok(LeafNode::from_page(self.store.read(page_id)?)?)
    }

    fn read_internal(&mut self, page_id: PageId) -> Result<InternalNode, BTreeError> {
        Ok(InternalNode::from_page(self.store.read(page_id)?)?)
    }

    /// A path longer than the number of pages, or a walk visiting more nodes
    /// than there are pages, can only come from a cycle.
    fn check_depth(&self, depth: usize) -> Result<(), BTreeError> {
        if depth as u64 > self.store.total_pages() {
            return Err(BTreeError::Corrupt(format!(
                "descent exceeded {} levels",
                self.store.total_pages()
            )));
        }
        Ok(())
    }

    /// Walk from the root to the leaf that owns `key`.
    ///
    /// At each internal node the rightmost separator `<= key` is taken. A key
    /// smaller than every separator goes to the first child.
    fn descend(&mut self, key: &[u8]) -> Result<Option<Descent>, BTreeError> {
        if self.header.is_empty() {
            return Ok(None);
        }

        let mut ancestors = Vec::new();
        let mut page_id = self.header.root;
        let mut is_last = true;
        loop {
            self.check_depth(ancestors.len())?;
            match self.read_node(page_id)? {
                Node::Leaf(leaf) => {
                    return Ok(Some(Descent {
                        leaf,
                        path: LeafPath {
                            page: page_id,
                            ancestors,
                        },
                        is_last,
                    }));
                }
                Node::Internal(node) => {
                    let children = node.children();
                    if children.is_empty() {
                        return Err(BTreeError::Corrupt(format!(
                            "internal node {page_id} has no children"
                        )));
                    }
                    let index = route(&children, key).unwrap_or(0);
                    is_last &= index + 1 == children.len();
                    ancestors.push(page_id);
                    page_id = children[index].page;
                }
                Node::Overflow(_) => {
                    return Err(BTreeError::Corrupt(format!(
                        "overflow segment {page_id} linked as a tree node"
                    )));
                }
            }
        }
    }

    fn set_root(&mut self, root: PageId) -> Result<(), BTreeError> {
        self.header.root = root;
        self.store.write_header(&self.header.to_page())?;
        tracing::debug!(root, "root changed");
        Ok(())
    }

    /// Rename a leaf's separator in its ancestors after its first key moved.
    fn refresh_separator(
        &mut self,
        path: &LeafPath,
        old_first: Option<&[u8]>,
        new_first: Option<Vec<u8>>,
    ) -> Result<(), BTreeError> {
        if old_first == new_first.as_deref() {
            return Ok(());
        }
        let replacement = new_first
            .map(|key| vec![ChildEntry { key, page: path.page }])
            .unwrap_or_default();
        self.relink(&path.ancestors, path.page, replacement)
    }

    /// Split a full leaf that `key` routes to.
    ///
    /// The leaf keeps as many of the smallest entries as fit. The entries
    /// bumped out of it either go into new leaves right after it (when it is
    /// the last leaf) or are shifted into the following leaves.
    fn split_leaf(
        &mut self,
        leaf: &LeafNode,
        path: &LeafPath,
        is_last: bool,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), BTreeError> {
        let old_first = leaf.first_key();
        let (left, bumped) = match leaf.split(key, value) {
            Ok((left, right)) => (left, right.entries()),
            Err(NodeError::CapacityExceeded { .. }) => {
                // Too bulky for two leaves; keep the left-biased fill and
                // carry everything else forward.
                let mut entries = leaf.entries();
                entries.push(LeafEntry::new(key, value));
                sort_entries(&mut entries);
                let mut packed = LeafNode::pack(leaf.parent(), entries)?.into_iter();
                let left = packed.next().ok_or_else(|| {
                    BTreeError::Corrupt(format!("splitting leaf {} produced nothing", path.page))
                })?;
                (left, packed.flat_map(|l| l.entries()).collect())
            }
            Err(e) => return Err(e.into()),
        };

        self.store.write(path.page, left.page())?;
        let left_first = left.first_key();

        if is_last {
            tracing::debug!(page = path.page, bumped = bumped.len(), "split last leaf");
            return self.append_leaves(path, left_first, bumped);
        }

        self.refresh_separator(path, old_first.as_deref(), left_first)?;
        tracing::debug!(page = path.page, bumped = bumped.len(), "shifting entries forward");
        self.shift(path.page, bumped)
    }

    /// Push bumped entries into the leaves following `start`.
    ///
    /// Each following leaf absorbs the pending entries and keeps the smallest
    /// of its combined contents; whatever no longer fits moves on to the next
    /// leaf. Entries left over at the last leaf, or in front of an overflowed
    /// leaf, are placed in new leaves.
    fn shift(&mut self, start: PageId, mut pending: Vec<LeafEntry>) -> Result<(), BTreeError> {
        let mut previous = start;

        while !pending.is_empty() {
            let previous_path = self.path_to(previous)?;
            let next_path = self.successor(&previous_path)?;

            let next = match next_path {
                Some(path) => {
                    let leaf = self.read_leaf(path.page)?;
                    (!leaf.has_overflow()).then_some((leaf, path))
                }
                None => None,
            };

            let Some((leaf, path)) = next else {
                let previous_first = self.read_leaf(previous)?.first_key();
                return self.append_leaves(&previous_path, previous_first, pending);
            };

            let old_first = leaf.first_key();
            let mut entries = pending;
            entries.extend(leaf.entries());
            sort_entries(&mut entries);

            let mut packed = LeafNode::pack(leaf.parent(), entries)?.into_iter();
            let kept = packed.next().ok_or_else(|| {
                BTreeError::Corrupt(format!("shifting into leaf {} produced nothing", path.page))
            })?;
            pending = packed.flat_map(|l| l.entries()).collect();

            self.store.write(path.page, kept.page())?;
            self.refresh_separator(&path, old_first.as_deref(), kept.first_key())?;
            tracing::debug!(page = path.page, carried = pending.len(), "shifted into leaf");
            previous = path.page;
        }

        Ok(())
    }

    /// Rebuild the ancestor path of the leaf at `page` from parent pointers.
    ///
    /// Separator renames during a shift can split ancestors, so a path taken
    /// before the rename may no longer hold.
    fn path_to(&mut self, page: PageId) -> Result<LeafPath, BTreeError> {
        let mut ancestors = Vec::new();
        let mut parent = self.read_leaf(page)?.parent();
        while parent != 0 {
            self.check_depth(ancestors.len())?;
            ancestors.push(parent);
            parent = self.read_internal(parent)?.parent();
        }
        ancestors.reverse();

        if ancestors.first().copied().unwrap_or(page) != self.header.root {
            return Err(BTreeError::Corrupt(format!("leaf {page} is not reachable")));
        }
        Ok(LeafPath { page, ancestors })
    }

    /// The leaf after `path` in key order.
    ///
    /// Climbs to the deepest ancestor with a later child and descends along
    /// first children from there.
    fn successor(&mut self, path: &LeafPath) -> Result<Option<LeafPath>, BTreeError> {
        let mut child = path.page;
        for (level, &ancestor) in path.ancestors.iter().enumerate().rev() {
            let children = self.read_internal(ancestor)?.children();
            let index = children
                .iter()
                .position(|c| c.page == child)
                .ok_or_else(|| {
                    BTreeError::Corrupt(format!("page {child} is not a child of page {ancestor}"))
                })?;

            if let Some(next) = children.get(index + 1) {
                let mut ancestors = path.ancestors[..=level].to_vec();
                let mut page = next.page;
                loop {
                    self.check_depth(ancestors.len())?;
                    match self.read_node(page)? {
                        Node::Leaf(_) => return Ok(Some(LeafPath { page, ancestors })),
                        Node::Internal(node) => {
                            let first = node.children().first().map(|c| c.page).ok_or_else(|| {
                                BTreeError::Corrupt(format!("internal node {page} has no children"))
                            })?;
                            ancestors.push(page);
                            page = first;
                        }
                        Node::Overflow(_) => {
                            return Err(BTreeError::Corrupt(format!(
                                "overflow segment {page} linked as a tree node"
                            )));
                        }
                    }
                }
            }
            child = ancestor;
        }
        Ok(None)
    }

    /// Store `entries` in new leaves placed right after the leaf at `path`.
    fn append_leaves(
        &mut self,
        path: &LeafPath,
        first_key: Option<Vec<u8>>,
        entries: Vec<LeafEntry>,
    ) -> Result<(), BTreeError> {
        let mut replacement = Vec::new();
        if let Some(key) = first_key {
            replacement.push(ChildEntry {
                key,
                page: path.page,
            });
        }

        for leaf in LeafNode::pack(path.parent(), entries)? {
            let key = leaf.first_key().unwrap_or_default();
            let page = self.store.allocate(leaf.page())?;
            replacement.push(ChildEntry { key, page });
        }

        self.relink(&path.ancestors, path.page, replacement)
    }

    /// Add a leaf for a small entry next to an overflowed leaf, which can
    /// never take more entries.
    fn insert_beside_overflow_leaf(
        &mut self,
        path: &LeafPath,
        leaf: &LeafNode,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), BTreeError> {
        let mut new_leaf = LeafNode::new(path.parent());
        new_leaf.put_kv(key, value)?;
        let new_page = self.store.allocate(new_leaf.page())?;

        let existing = ChildEntry {
            key: leaf.first_key().unwrap_or_default(),
            page: path.page,
        };
        let added = ChildEntry::new(key, new_page);
        let replacement = if existing.key.as_slice() <= key {
            vec![existing, added]
        } else {
            vec![added, existing]
        };

        tracing::debug!(page = path.page, new_page, "added leaf beside overflowed leaf");
        self.relink(&path.ancestors, path.page, replacement)
    }

    /// Insert a value too large for one leaf.
    ///
    /// The overflowed leaf is placed so that leaf order stays sorted: the
    /// target leaf is cut into the entries sorting at or before `key` and
    /// those after it, with the new leaf in between.
    fn insert_overflow(
        &mut self,
        descent: Descent,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), BTreeError> {
        let Descent { leaf, path, .. } = descent;
        let parent = path.parent();
        let overflow_page = write_overflow_leaf(&mut self.store, parent, key, value)?;
        let added = ChildEntry::new(key, overflow_page);

        let replacement = if leaf.has_overflow() {
            let existing = ChildEntry {
                key: leaf.first_key().unwrap_or_default(),
                page: path.page,
            };
            if existing.key.as_slice() <= key {
                vec![existing, added]
            } else {
                vec![added, existing]
            }
        } else {
            let (lower, upper): (Vec<LeafEntry>, Vec<LeafEntry>) = leaf
                .entries()
                .into_iter()
                .partition(|entry| entry.key.as_slice() <= key);

            let mut replacement = Vec::new();
            if lower.is_empty() {
                replacement.push(added);
                if let Some(first) = upper.first() {
                    replacement.push(ChildEntry::new(&first.key, path.page));
                }
            } else {
                for (index, piece) in LeafNode::pack(parent, lower)?.into_iter().enumerate() {
                    let first = piece.first_key().unwrap_or_default();
                    let page = if index == 0 {
                        self.store.write(path.page, piece.page())?;
                        path.page
                    } else {
                        self.store.allocate(piece.page())?
                    };
                    replacement.push(ChildEntry { key: first, page });
                }
                replacement.push(added);
                for piece in LeafNode::pack(parent, upper)? {
                    let first = piece.first_key().unwrap_or_default();
                    let page = self.store.allocate(piece.page())?;
                    replacement.push(ChildEntry { key: first, page });
                }
            }
            replacement
        };

        self.relink(&path.ancestors, path.page, replacement)
    }

    /// Replace the entry for `child` in its parent with `replacement`.
    ///
    /// `ancestors` runs from the root down to `child`'s parent. The parent is
    /// rewritten in order; if it no longer fits in one page it is split
    /// (left-biased) and the pieces are linked into the grandparent the same
    /// way. A parent whose first separator changed is renamed in the
    /// grandparent, and a parent left with no children is unlinked.
    fn relink(
        &mut self,
        ancestors: &[PageId],
        child: PageId,
        replacement: Vec<ChildEntry>,
    ) -> Result<(), BTreeError> {
        let Some((&parent_page, above)) = ancestors.split_last() else {
            return self.replace_root(replacement);
        };

        let parent = self.read_internal(parent_page)?;
        let mut children = parent.children();
        let old_first = children.first().map(|c| c.key.clone());
        let index = children
            .iter()
            .position(|c| c.page == child)
            .ok_or_else(|| {
                BTreeError::Corrupt(format!("page {child} is not a child of page {parent_page}"))
            })?;
        let adopted: Vec<PageId> = replacement
            .iter()
            .map(|c| c.page)
            .filter(|&page| page != child)
            .collect();
        let tail = children.split_off(index + 1);
        children.pop();
        children.extend(replacement);
        children.extend(tail);

        if children.is_empty() {
            tracing::debug!(page = parent_page, "unlinking empty internal node");
            return self.relink(above, parent_page, Vec::new());
        }

        let mut nodes = InternalNode::pack(parent.parent(), children)?.into_iter();
        let first = nodes.next().ok_or_else(|| {
            BTreeError::Corrupt(format!("rewriting node {parent_page} produced nothing"))
        })?;
        let new_first = first.first_key();
        self.store.write(parent_page, first.page())?;
        self.adopt(&first, parent_page, |page| adopted.contains(&page))?;

        let mut level = vec![ChildEntry {
            key: new_first.clone().unwrap_or_default(),
            page: parent_page,
        }];
        for node in nodes {
            let page = self.store.allocate(node.page())?;
            self.adopt(&node, page, |_| true)?;
            level.push(ChildEntry {
                key: node.first_key().unwrap_or_default(),
                page,
            });
        }

        if level.len() == 1 && new_first == old_first {
            return Ok(());
        }
        if level.len() > 1 {
            tracing::debug!(page = parent_page, pieces = level.len(), "split internal node");
        }
        self.relink(above, parent_page, level)
    }

    /// Install a new top level, growing new roots until one node holds it.
    fn replace_root(&mut self, mut level: Vec<ChildEntry>) -> Result<(), BTreeError> {
        loop {
            match level.len() {
                0 => {
                    tracing::debug!("tree is now empty");
                    return self.set_root(0);
                }
                1 => {
                    let root = level[0].page;
                    if root != self.header.root {
                        self.set_parent(root, 0)?;
                        self.set_root(root)?;
                    }
                    return Ok(());
                }
                _ => {
                    let mut next = Vec::new();
                    for node in InternalNode::pack(0, level)? {
                        let key = node.first_key().unwrap_or_default();
                        let page = self.store.allocate(node.page())?;
                        self.adopt(&node, page, |_| true)?;
                        next.push(ChildEntry { key, page });
                    }
                    tracing::debug!(nodes = next.len(), "grew a new root level");
                    level = next;
                }
            }
        }
    }

    /// Point the selected children of `node` at their new parent page.
    fn adopt(
        &mut self,
        node: &InternalNode,
        page: PageId,
        selected: impl Fn(PageId) -> bool,
    ) -> Result<(), BTreeError> {
        for child in node.children() {
            if selected(child.page) {
                self.set_parent(child.page, page)?;
            }
        }
        Ok(())
    }

    fn set_parent(&mut self, page_id: PageId, parent: PageId) -> Result<(), BTreeError> {
        match self.read_node(page_id)? {
            Node::Internal(mut node) => {
                if node.parent() != parent {
                    node.set_parent(parent);
                    self.store.write(page_id, node.page())?;
                }
            }
            Node::Leaf(mut leaf) => {
                if leaf.parent() != parent {
                    leaf.set_parent(parent);
                    self.store.write(page_id, leaf.page())?;
                }
            }
            Node::Overflow(_) => {
                return Err(BTreeError::Corrupt(format!(
                    "overflow segment {page_id} linked as a tree node"
                )));
            }
        }
        Ok(())
    }
}

/// Errors that can occur during tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Page store error.
    Storage(StorageError),
    /// Node encoding error.
    Node(NodeError),
    /// Header page error.
    Header(HeaderError),
    /// Overflow chain error.
    Overflow(OverflowError),
    /// Key longer than `MAX_KEY_SIZE`.
    KeyTooLarge { len: usize, max: usize },
    /// `create` was given a store that already holds pages.
    StoreNotEmpty { total_pages: u64 },
    /// `open` was given a store without a header page.
    MissingHeader,
    /// The pages do not form a valid tree.
    Corrupt(String),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Header(e) => write!(f, "header error: {e}"),
            Self::Overflow(e) => write!(f, "overflow error: {e}"),
            Self::KeyTooLarge { len, max } => {
                write!(f, "key is {len} bytes, at most {max} allowed")
            }
            Self::StoreNotEmpty { total_pages } => {
                write!(f, "cannot create a tree in a store with {total_pages} pages")
            }
            Self::MissingHeader => write!(f, "store has no header page"),
            Self::Corrupt(msg) => write!(f, "corrupt tree: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::Header(e) => Some(e),
            Self::Overflow(e) => Some(e),
            Self::KeyTooLarge { .. }
            | Self::StoreNotEmpty { .. }
            | Self::MissingHeader
            | Self::Corrupt(_) => None,
        }
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<HeaderError> for BTreeError {
    fn from(e: HeaderError) -> Self {
        Self::Header(e)
    }
}

impl From<OverflowError> for BTreeError {
    fn from(e: OverflowError) -> Self {
        // Surface I/O failures uniformly whichever layer hit them.
        match e {
            OverflowError::Storage(e) => Self::Storage(e),
            other => Self::Overflow(other),
        }
    }
}
