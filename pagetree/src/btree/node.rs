//! B-tree node codec.
//!
//! Every node occupies one 4KB page and is one of three kinds:
//! - Internal nodes: store (separator key, child page) pairs
//! - Leaf nodes: store (key, value) pairs, plus an optional overflow pointer
//! - Overflow segments: hold the tail of a value too large for one leaf
//!
//! # Page Layout
//!
//! Internal nodes and leaves share a 16-byte header:
//!
//! ```text
//! +--------+---------+------------+-------------+--------------+
//! | type   | n_items | free_bytes | parent_addr | write_offset |
//! | u16 @0 | u16 @2  | u16 @4     | u64 @6      | u16 @14      |
//! +--------+---------+------------+-------------+--------------+
//! ```
//!
//! Internal body (from offset 16): `key_len:u16 | key | child_addr:u64`.
//!
//! Leaves add `has_overflow:u16 @16 | overflow_addr:u64 @18` and their body
//! starts at offset 26: `key_len:u16 | value_len:u64 | key | value`.
//!
//! Overflow segments keep only the type field of the common header:
//! `type:u16 @0 | has_overflow:u16 @2 | overflow_addr:u64 @4 |
//! segment_len:u16 @12 | bytes @14`.
//!
//! Entries are appended in insertion order. Every accessor decodes all
//! entries and sorts them by byte-lexicographic key before returning them.

// All offsets and lengths are bounded by PAGE_SIZE, which fits in u16.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::{PAGE_SIZE, Page, PageId};

/// Size of the header shared by internal nodes and leaves.
pub const NODE_HEADER_SIZE: usize = 16;

/// Offset where internal node entries start.
pub const INTERNAL_BODY_OFFSET: usize = NODE_HEADER_SIZE;

/// Offset where leaf entries start (after `has_overflow` and `overflow_addr`).
pub const LEAF_BODY_OFFSET: usize = NODE_HEADER_SIZE + 10;

/// Offset where overflow segment bytes start.
pub const SEGMENT_BODY_OFFSET: usize = 14;

/// Bytes available for entries in an empty internal node.
pub const INTERNAL_CAPACITY: usize = PAGE_SIZE - INTERNAL_BODY_OFFSET;

/// Bytes available for entries in an empty leaf.
pub const LEAF_CAPACITY: usize = PAGE_SIZE - LEAF_BODY_OFFSET;

/// Bytes of value data one overflow segment can hold.
pub const SEGMENT_CAPACITY: usize = PAGE_SIZE - SEGMENT_BODY_OFFSET;

/// Fixed per-entry overhead: a 2-byte key length plus an 8-byte value
/// length (leaves) or child address (internal nodes).
pub const ENTRY_OVERHEAD: usize = 10;

/// Field offsets within a node page.
mod offsets {
    pub const TYPE: usize = 0;
    pub const N_ITEMS: usize = 2;
    pub const FREE_BYTES: usize = 4;
    pub const PARENT: usize = 6;
    pub const WRITE_OFFSET: usize = 14;
    pub const LEAF_HAS_OVERFLOW: usize = 16;
    pub const LEAF_OVERFLOW_ADDR: usize = 18;
    pub const SEGMENT_HAS_OVERFLOW: usize = 2;
    pub const SEGMENT_OVERFLOW_ADDR: usize = 4;
    pub const SEGMENT_LEN: usize = 12;
}

/// Serialized size of a leaf entry.
#[must_use]
pub const fn leaf_entry_size(key_len: usize, value_len: usize) -> usize {
    ENTRY_OVERHEAD + key_len + value_len
}

/// Serialized size of an internal node entry.
#[must_use]
pub const fn child_entry_size(key_len: usize) -> usize {
    ENTRY_OVERHEAD + key_len
}

/// Number of value bytes an overflowed leaf keeps inline for a key of
/// `key_len` bytes. The rest of the value goes to overflow segments.
#[must_use]
pub const fn overflow_prefix_len(key_len: usize) -> usize {
    LEAF_CAPACITY.saturating_sub(ENTRY_OVERHEAD + key_len)
}

/// Node type discriminant stored at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeKind {
    Internal = 0,
    Leaf = 1,
    OverflowSegment = 2,
}

impl TryFrom<u16> for NodeKind {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Leaf),
            2 => Ok(Self::OverflowSegment),
            _ => Err(value),
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::Leaf => write!(f, "leaf"),
            Self::OverflowSegment => write!(f, "overflow segment"),
        }
    }
}

/// Read the kind tag of any node page.
pub fn node_kind(page: &Page) -> Result<NodeKind, NodeError> {
    NodeKind::try_from(page.read_u16(offsets::TYPE)).map_err(NodeError::InvalidNodeType)
}

/// Header shared by internal nodes and leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub kind: NodeKind,
    pub n_items: u16,
    pub free_bytes: u16,
    pub parent: PageId,
    pub write_offset: u16,
}

impl NodeHeader {
    /// Read a node header from a page.
    pub fn from_page(page: &Page) -> Result<Self, NodeError> {
        Ok(Self {
            kind: node_kind(page)?,
            n_items: page.read_u16(offsets::N_ITEMS),
            free_bytes: page.read_u16(offsets::FREE_BYTES),
            parent: page.read_u64(offsets::PARENT),
            write_offset: page.read_u16(offsets::WRITE_OFFSET),
        })
    }

    /// Write a node header to a page.
    pub fn write_to_page(&self, page: &mut Page) {
        page.write_u16(offsets::TYPE, self.kind as u16);
        page.write_u16(offsets::N_ITEMS, self.n_items);
        page.write_u16(offsets::FREE_BYTES, self.free_bytes);
        page.write_u64(offsets::PARENT, self.parent);
        page.write_u16(offsets::WRITE_OFFSET, self.write_offset);
    }

    const fn empty(kind: NodeKind, parent: PageId, body_offset: usize) -> Self {
        Self {
            kind,
            n_items: 0,
            free_bytes: (PAGE_SIZE - body_offset) as u16,
            parent,
            write_offset: body_offset as u16,
        }
    }
}

/// A separator key and the child page it routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub key: Vec<u8>,
    pub page: PageId,
}

impl ChildEntry {
    #[must_use]
    pub fn new(key: &[u8], page: PageId) -> Self {
        Self {
            key: key.to_vec(),
            page,
        }
    }

    fn size(&self) -> usize {
        child_entry_size(self.key.len())
    }
}

/// A key-value pair stored in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafEntry {
    #[must_use]
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    fn size(&self) -> usize {
        leaf_entry_size(self.key.len(), self.value.len())
    }
}

/// Check that the header counters agree with each other and that every
/// entry lies inside the written region, so later decoding cannot read past
/// the end of the page.
fn validate_body(
    page: &Page,
    body_offset: usize,
    entry_span: impl Fn(&Page, usize) -> Option<usize>,
) -> Result<(), NodeError> {
    let header = NodeHeader::from_page(page)?;
    let write_offset = usize::from(header.write_offset);

    if write_offset < body_offset || write_offset > PAGE_SIZE {
        return Err(NodeError::Malformed(format!(
            "write offset {write_offset} outside body"
        )));
    }
    if usize::from(header.free_bytes) != PAGE_SIZE - write_offset {
        return Err(NodeError::Malformed(format!(
            "free bytes {} disagree with write offset {write_offset}",
            header.free_bytes
        )));
    }

    let mut offset = body_offset;
    for index in 0..header.n_items {
        let end = if offset + 2 <= write_offset {
            entry_span(page, offset).and_then(|span| offset.checked_add(span))
        } else {
            None
        };
        match end {
            Some(end) if end <= write_offset => offset = end,
            _ => {
                return Err(NodeError::Malformed(format!(
                    "entry {index} extends past the written region"
                )));
            }
        }
    }

    if offset != write_offset {
        return Err(NodeError::Malformed(format!(
            "{} entries end at {offset}, write offset is {write_offset}",
            header.n_items
        )));
    }
    Ok(())
}

fn expect_kind(page: &Page, expected: NodeKind) -> Result<(), NodeError> {
    let actual = node_kind(page)?;
    if actual != expected {
        return Err(NodeError::WrongNodeType { expected, actual });
    }
    Ok(())
}

/// Pack entries, in order, into as few nodes as possible.
///
/// Each node is filled until the next entry would not fit, so all nodes but
/// the last are as full as possible.
fn pack_greedy<E>(
    entries: Vec<E>,
    capacity: usize,
    size: impl Fn(&E) -> usize,
) -> Result<Vec<Vec<E>>, NodeError> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;

    for entry in entries {
        let needed = size(&entry);
        if needed > capacity {
            return Err(NodeError::CapacityExceeded {
                needed,
                free: capacity,
            });
        }
        if used + needed > capacity {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += needed;
        current.push(entry);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// An internal node over a raw page.
#[derive(Debug, Clone)]
pub struct InternalNode {
    page: Page,
}

impl InternalNode {
    /// Create a new empty internal node.
    #[must_use]
    pub fn new(parent: PageId) -> Self {
        let mut page = Page::new();
        NodeHeader::empty(NodeKind::Internal, parent, INTERNAL_BODY_OFFSET).write_to_page(&mut page);
        Self { page }
    }

    /// Interpret a page as an internal node.
    pub fn from_page(page: Page) -> Result<Self, NodeError> {
        expect_kind(&page, NodeKind::Internal)?;
        validate_body(&page, INTERNAL_BODY_OFFSET, |page, offset| {
            let key_len = usize::from(page.read_u16(offset));
            Some(child_entry_size(key_len))
        })?;
        Ok(Self { page })
    }

    /// Build nodes holding `entries` in the given order, filling each node
    /// before starting the next.
    pub fn pack(parent: PageId, entries: Vec<ChildEntry>) -> Result<Vec<Self>, NodeError> {
        pack_greedy(entries, INTERNAL_CAPACITY, ChildEntry::size)?
            .into_iter()
            .map(|chunk| {
                let mut node = Self::new(parent);
                for entry in &chunk {
                    node.put_child(&entry.key, entry.page)?;
                }
                Ok(node)
            })
            .collect()
    }

    /// The raw page.
    #[must_use]
    pub const fn page(&self) -> &Page {
        &self.page
    }

    /// Consume the node, returning the raw page.
    #[must_use]
    pub fn into_page(self) -> Page {
        self.page
    }

    #[must_use]
    pub fn header(&self) -> NodeHeader {
        // The kind tag was validated on construction.
        NodeHeader {
            kind: NodeKind::Internal,
            n_items: self.page.read_u16(offsets::N_ITEMS),
            free_bytes: self.page.read_u16(offsets::FREE_BYTES),
            parent: self.page.read_u64(offsets::PARENT),
            write_offset: self.page.read_u16(offsets::WRITE_OFFSET),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.page.read_u16(offsets::N_ITEMS))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        usize::from(self.page.read_u16(offsets::FREE_BYTES))
    }

    #[must_use]
    pub fn parent(&self) -> PageId {
        self.page.read_u64(offsets::PARENT)
    }

    pub fn set_parent(&mut self, parent: PageId) {
        self.page.write_u64(offsets::PARENT, parent);
    }

    /// Whether a child with a key of `key_len` bytes can still be added.
    #[must_use]
    pub fn fits(&self, key_len: usize) -> bool {
        self.free_bytes() >= child_entry_size(key_len)
    }

    /// All children, sorted by separator key.
    ///
    /// The sort is stable, so children with equal separators keep the order
    /// in which they were written.
    #[must_use]
    pub fn children(&self) -> Vec<ChildEntry> {
        let mut children = Vec::with_capacity(self.len());
        let mut offset = INTERNAL_BODY_OFFSET;
        for _ in 0..self.len() {
            let key_len = usize::from(self.page.read_u16(offset));
            let key = self.page.read_bytes(offset + 2, key_len).to_vec();
            let page = self.page.read_u64(offset + 2 + key_len);
            children.push(ChildEntry { key, page });
            offset += child_entry_size(key_len);
        }
        children.sort_by(|a, b| a.key.cmp(&b.key));
        children
    }

    /// The child at `index` in sorted order.
    pub fn child(&self, index: usize) -> Result<ChildEntry, NodeError> {
        let len = self.len();
        self.children()
            .into_iter()
            .nth(index)
            .ok_or(NodeError::IndexOutOfRange { index, len })
    }

    /// The smallest separator key.
    #[must_use]
    pub fn first_key(&self) -> Option<Vec<u8>> {
        self.children().into_iter().next().map(|child| child.key)
    }

    /// Append a child at the write offset.
    pub fn put_child(&mut self, key: &[u8], child: PageId) -> Result<(), NodeError> {
        let needed = child_entry_size(key.len());
        let free = self.free_bytes();
        if free < needed {
            return Err(NodeError::CapacityExceeded { needed, free });
        }

        let mut header = self.header();
        let offset = usize::from(header.write_offset);
        self.page.write_u16(offset, key.len() as u16);
        self.page.write_bytes(offset + 2, key);
        self.page.write_u64(offset + 2 + key.len(), child);

        header.n_items += 1;
        header.free_bytes -= needed as u16;
        header.write_offset += needed as u16;
        header.write_to_page(&mut self.page);
        Ok(())
    }

    /// Remove the child pointing at `child`.
    pub fn delete_child_by_address(&mut self, child: PageId) {
        self.retain(|entry| entry.page != child);
    }

    /// Remove every child whose separator equals `key`.
    pub fn delete_child_by_key(&mut self, key: &[u8]) {
        self.retain(|entry| entry.key != key);
    }

    /// Rewrite the node with only the children matching `keep`.
    fn retain(&mut self, keep: impl Fn(&ChildEntry) -> bool) {
        let survivors: Vec<ChildEntry> = self.children().into_iter().filter(keep).collect();
        self.reset();
        for entry in &survivors {
            // Survivors occupied this node before, so they still fit.
            let _ = self.put_child(&entry.key, entry.page);
        }
    }

    /// Drop every child, keeping the parent pointer.
    pub fn reset(&mut self) {
        let parent = self.parent();
        self.page.clear();
        NodeHeader::empty(NodeKind::Internal, parent, INTERNAL_BODY_OFFSET)
            .write_to_page(&mut self.page);
    }

    /// Split this node's children plus one new child across two nodes.
    ///
    /// The combined children are sorted and the first node is filled until
    /// the next child would not fit; the second node takes the remainder.
    pub fn split(&self, key: &[u8], child: PageId) -> Result<(Self, Self), NodeError> {
        let mut entries = self.children();
        entries.push(ChildEntry::new(key, child));
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let parent = self.parent();
        let mut nodes = Self::pack(parent, entries)?.into_iter();
        let left = nodes.next().unwrap_or_else(|| Self::new(parent));
        let right = nodes.next().unwrap_or_else(|| Self::new(parent));
        if let Some(extra) = nodes.next() {
            return Err(NodeError::CapacityExceeded {
                needed: INTERNAL_CAPACITY - extra.free_bytes(),
                free: right.free_bytes(),
            });
        }
        Ok((left, right))
    }
}

/// A leaf node over a raw page.
#[derive(Debug, Clone)]
pub struct LeafNode {
    page: Page,
}

impl LeafNode {
    /// Create a new empty leaf.
    #[must_use]
    pub fn new(parent: PageId) -> Self {
        let mut page = Page::new();
        NodeHeader::empty(NodeKind::Leaf, parent, LEAF_BODY_OFFSET).write_to_page(&mut page);
        Self { page }
    }

    /// Interpret a page as a leaf.
    pub fn from_page(page: Page) -> Result<Self, NodeError> {
        expect_kind(&page, NodeKind::Leaf)?;
        validate_body(&page, LEAF_BODY_OFFSET, |page, offset| {
            if offset + ENTRY_OVERHEAD > PAGE_SIZE {
                return None;
            }
            let key_len = usize::from(page.read_u16(offset));
            let value_len = usize::try_from(page.read_u64(offset + 2)).ok()?;
            ENTRY_OVERHEAD.checked_add(key_len)?.checked_add(value_len)
        })?;
        Ok(Self { page })
    }

    /// Build leaves holding `entries` in the given order, filling each leaf
    /// before starting the next.
    pub fn pack(parent: PageId, entries: Vec<LeafEntry>) -> Result<Vec<Self>, NodeError> {
        pack_greedy(entries, LEAF_CAPACITY, LeafEntry::size)?
            .into_iter()
            .map(|chunk| {
                let mut leaf = Self::new(parent);
                for entry in &chunk {
                    leaf.put_kv(&entry.key, &entry.value)?;
                }
                Ok(leaf)
            })
            .collect()
    }

    /// Build a leaf for a value too large to fit in one page.
    ///
    /// The leaf keeps the key and as much of the value as fits beside it.
    /// The remainder is sliced into overflow segments, returned in chain
    /// order and not yet linked to each other or to the leaf.
    pub fn with_overflow(
        parent: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Self, Vec<OverflowSegment>), NodeError> {
        let prefix_len = overflow_prefix_len(key.len()).min(value.len());
        let (prefix, rest) = value.split_at(prefix_len);

        let mut leaf = Self::new(parent);
        leaf.put_kv(key, prefix)?;

        let segments = rest
            .chunks(SEGMENT_CAPACITY)
            .map(OverflowSegment::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((leaf, segments))
    }

    /// The raw page.
    #[must_use]
    pub const fn page(&self) -> &Page {
        &self.page
    }

    /// Consume the leaf, returning the raw page.
    #[must_use]
    pub fn into_page(self) -> Page {
        self.page
    }

    #[must_use]
    pub fn header(&self) -> NodeHeader {
        NodeHeader {
            kind: NodeKind::Leaf,
            n_items: self.page.read_u16(offsets::N_ITEMS),
            free_bytes: self.page.read_u16(offsets::FREE_BYTES),
            parent: self.page.read_u64(offsets::PARENT),
            write_offset: self.page.read_u16(offsets::WRITE_OFFSET),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.page.read_u16(offsets::N_ITEMS))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        usize::from(self.page.read_u16(offsets::FREE_BYTES))
    }

    #[must_use]
    pub fn parent(&self) -> PageId {
        self.page.read_u64(offsets::PARENT)
    }

    pub fn set_parent(&mut self, parent: PageId) {
        self.page.write_u64(offsets::PARENT, parent);
    }

    /// Whether this leaf's single value continues in overflow segments.
    #[must_use]
    pub fn has_overflow(&self) -> bool {
        self.page.read_u16(offsets::LEAF_HAS_OVERFLOW) != 0
    }

    /// First overflow segment, if the value continues beyond this leaf.
    #[must_use]
    pub fn overflow_page(&self) -> Option<PageId> {
        self.has_overflow()
            .then(|| self.page.read_u64(offsets::LEAF_OVERFLOW_ADDR))
    }

    pub fn set_overflow_page(&mut self, segment: Option<PageId>) {
        self.page
            .write_u16(offsets::LEAF_HAS_OVERFLOW, u16::from(segment.is_some()));
        self.page
            .write_u64(offsets::LEAF_OVERFLOW_ADDR, segment.unwrap_or(0));
    }

    /// Whether an entry of the given sizes can still be added.
    #[must_use]
    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        self.free_bytes() >= leaf_entry_size(key_len, value_len)
    }

    /// All entries, sorted by key.
    #[must_use]
    pub fn entries(&self) -> Vec<LeafEntry> {
        let mut entries = Vec::with_capacity(self.len());
        let mut offset = LEAF_BODY_OFFSET;
        for _ in 0..self.len() {
            let key_len = usize::from(self.page.read_u16(offset));
            // Lengths were bounds-checked when the page was decoded.
            let value_len = self.page.read_u64(offset + 2) as usize;
            let key_start = offset + ENTRY_OVERHEAD;
            let key = self.page.read_bytes(key_start, key_len).to_vec();
            let value = self.page.read_bytes(key_start + key_len, value_len).to_vec();
            entries.push(LeafEntry { key, value });
            offset += leaf_entry_size(key_len, value_len);
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// The entry at `index` in sorted order.
    pub fn entry(&self, index: usize) -> Result<LeafEntry, NodeError> {
        let len = self.len();
        self.entries()
            .into_iter()
            .nth(index)
            .ok_or(NodeError::IndexOutOfRange { index, len })
    }

    /// The smallest key.
    #[must_use]
    pub fn first_key(&self) -> Option<Vec<u8>> {
        self.entries().into_iter().next().map(|entry| entry.key)
    }

    /// Value of the first entry (in key order) whose key equals `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries()
            .into_iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value)
    }

    /// Append a key-value pair at the write offset.
    pub fn put_kv(&mut self, key: &[u8], value: &[u8]) -> Result<(), NodeError> {
        let needed = leaf_entry_size(key.len(), value.len());
        let free = self.free_bytes();
        if free < needed {
            return Err(NodeError::CapacityExceeded { needed, free });
        }

        let mut header = self.header();
        let offset = usize::from(header.write_offset);
        self.page.write_u16(offset, key.len() as u16);
        self.page.write_u64(offset + 2, value.len() as u64);
        self.page.write_bytes(offset + ENTRY_OVERHEAD, key);
        self.page
            .write_bytes(offset + ENTRY_OVERHEAD + key.len(), value);

        header.n_items += 1;
        header.free_bytes -= needed as u16;
        header.write_offset += needed as u16;
        header.write_to_page(&mut self.page);
        Ok(())
    }

    /// Remove every entry whose key equals `key`, returning how many were
    /// removed.
    pub fn delete_kv_by_key(&mut self, key: &[u8]) -> usize {
        let entries = self.entries();
        let before = entries.len();
        let survivors: Vec<LeafEntry> = entries.into_iter().filter(|e| e.key != key).collect();
        let removed = before - survivors.len();
        if removed > 0 {
            self.reset();
            for entry in &survivors {
                // Survivors occupied this leaf before, so they still fit.
                let _ = self.put_kv(&entry.key, &entry.value);
            }
        }
        removed
    }

    /// Drop every entry, keeping the parent pointer and overflow fields.
    pub fn reset(&mut self) {
        let parent = self.parent();
        let overflow = self.overflow_page();
        self.page.clear();
        NodeHeader::empty(NodeKind::Leaf, parent, LEAF_BODY_OFFSET).write_to_page(&mut self.page);
        self.set_overflow_page(overflow);
    }

    /// Split this leaf's entries plus one new entry across two leaves.
    ///
    /// The combined entries are sorted and the left leaf is filled until the
    /// next entry would not fit; the right leaf takes the remainder. An
    /// overflowed leaf is never divided: it comes back unchanged and the new
    /// entry gets a leaf of its own.
    pub fn split(&self, key: &[u8], value: &[u8]) -> Result<(Self, Self), NodeError> {
        let parent = self.parent();
        if self.has_overflow() {
            let mut right = Self::new(parent);
            right.put_kv(key, value)?;
            return Ok((self.clone(), right));
        }

        let mut entries = self.entries();
        entries.push(LeafEntry::new(key, value));
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let mut leaves = Self::pack(parent, entries)?.into_iter();
        let left = leaves.next().unwrap_or_else(|| Self::new(parent));
        let right = leaves.next().unwrap_or_else(|| Self::new(parent));
        if let Some(extra) = leaves.next() {
            return Err(NodeError::CapacityExceeded {
                needed: LEAF_CAPACITY - extra.free_bytes(),
                free: right.free_bytes(),
            });
        }
        Ok((left, right))
    }
}

/// One link of an overflow chain.
#[derive(Debug, Clone)]
pub struct OverflowSegment {
    page: Page,
}

impl OverflowSegment {
    /// Create an unlinked segment holding `bytes`.
    pub fn new(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() > SEGMENT_CAPACITY {
            return Err(NodeError::CapacityExceeded {
                needed: bytes.len(),
                free: SEGMENT_CAPACITY,
            });
        }
        let mut page = Page::new();
        page.write_u16(offsets::TYPE, NodeKind::OverflowSegment as u16);
        page.write_u16(offsets::SEGMENT_LEN, bytes.len() as u16);
        page.write_bytes(SEGMENT_BODY_OFFSET, bytes);
        Ok(Self { page })
    }

    /// Interpret a page as an overflow segment.
    pub fn from_page(page: Page) -> Result<Self, NodeError> {
        expect_kind(&page, NodeKind::OverflowSegment)?;
        let len = usize::from(page.read_u16(offsets::SEGMENT_LEN));
        if len > SEGMENT_CAPACITY {
            return Err(NodeError::Malformed(format!(
                "segment length {len} exceeds capacity"
            )));
        }
        Ok(Self { page })
    }

    /// The raw page.
    #[must_use]
    pub const fn page(&self) -> &Page {
        &self.page
    }

    /// The bytes held by this segment.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let len = usize::from(self.page.read_u16(offsets::SEGMENT_LEN));
        self.page.read_bytes(SEGMENT_BODY_OFFSET, len)
    }

    /// The next segment in the chain, if any.
    #[must_use]
    pub fn next(&self) -> Option<PageId> {
        (self.page.read_u16(offsets::SEGMENT_HAS_OVERFLOW) != 0)
            .then(|| self.page.read_u64(offsets::SEGMENT_OVERFLOW_ADDR))
    }

    pub fn set_next(&mut self, next: Option<PageId>) {
        self.page
            .write_u16(offsets::SEGMENT_HAS_OVERFLOW, u16::from(next.is_some()));
        self.page
            .write_u64(offsets::SEGMENT_OVERFLOW_ADDR, next.unwrap_or(0));
    }
}

/// A decoded node of any kind.
#[derive(Debug, Clone)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
    Overflow(OverflowSegment),
}

impl Node {
    /// Decode a page according to its kind tag.
    pub fn from_page(page: Page) -> Result<Self, NodeError> {
        match node_kind(&page)? {
            NodeKind::Internal => InternalNode::from_page(page).map(Self::Internal),
            NodeKind::Leaf => LeafNode::from_page(page).map(Self::Leaf),
            NodeKind::OverflowSegment => OverflowSegment::from_page(page).map(Self::Overflow),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        match self {
            Self::Internal(_) => NodeKind::Internal,
            Self::Leaf(_) => NodeKind::Leaf,
            Self::Overflow(_) => NodeKind::OverflowSegment,
        }
    }
}

/// Errors related to node encoding and mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Unknown kind tag at offset 0.
    InvalidNodeType(u16),
    /// The page holds a different kind of node than the operation needs.
    WrongNodeType { expected: NodeKind, actual: NodeKind },
    /// The entry does not fit in the node's free space.
    CapacityExceeded { needed: usize, free: usize },
    /// Index past the last entry.
    IndexOutOfRange { index: usize, len: usize },
    /// Header counters or entry lengths are inconsistent.
    Malformed(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNodeType(v) => write!(f, "invalid node type: {v}"),
            Self::WrongNodeType { expected, actual } => {
                write!(f, "expected {expected} node, found {actual} node")
            }
            Self::CapacityExceeded { needed, free } => {
                write!(f, "entry needs {needed} bytes but only {free} are free")
            }
            Self::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for node with {len} entries")
            }
            Self::Malformed(msg) => write!(f, "malformed node: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn be(i: u32) -> [u8; 4] {
        i.to_be_bytes()
    }

    #[test]
    fn test_empty_node_free_bytes() {
        let internal = InternalNode::new(0);
        assert_eq!(internal.free_bytes(), 4080);
        assert_eq!(internal.header().write_offset, 16);

        let leaf = LeafNode::new(0);
        assert_eq!(leaf.free_bytes(), 4070);
        assert_eq!(leaf.header().write_offset, 26);
        assert!(!leaf.has_overflow());
    }

    #[test]
    fn test_put_child_accounting() {
        let mut node = InternalNode::new(7);
        node.put_child(b"1", 3).expect("put");

        assert_eq!(node.free_bytes(), 4069);
        assert_eq!(node.len(), 1);
        assert_eq!(node.parent(), 7);
        assert_eq!(node.child(0).expect("child"), ChildEntry::new(b"1", 3));
    }

    #[test]
    fn test_internal_node_fills_up() {
        let mut node = InternalNode::new(0);
        let mut count = 0u32;
        while node.put_child(&be(count), u64::from(count) + 1).is_ok() {
            count += 1;
        }

        // 4080 bytes / 14 bytes per 4-byte key.
        assert_eq!(count, 291);
        assert!(node.free_bytes() < child_entry_size(4));
        assert!(matches!(
            node.put_child(b"x", 1),
            Err(NodeError::CapacityExceeded { needed: 11, .. })
        ));
    }

    #[test]
    fn test_accessors_return_sorted_order() {
        let mut leaf = LeafNode::new(0);
        for key in [b"delta", b"alpha", b"charl", b"bravo"] {
            leaf.put_kv(key, key).expect("put");
        }

        let keys: Vec<Vec<u8>> = leaf.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"charl".to_vec(),
                b"delta".to_vec()
            ]
        );
        assert_eq!(leaf.entry(2).expect("entry").key, b"charl".to_vec());
        assert_eq!(leaf.first_key(), Some(b"alpha".to_vec()));
        assert!(matches!(
            leaf.entry(4),
            Err(NodeError::IndexOutOfRange { index: 4, len: 4 })
        ));
    }

    #[test]
    fn test_leaf_put_rejects_without_mutation() {
        let mut leaf = LeafNode::new(0);
        leaf.put_kv(b"k", &[1u8; 4000]).expect("put");
        let before = leaf.page().clone();

        let result = leaf.put_kv(b"j", &[2u8; 100]);
        assert!(matches!(result, Err(NodeError::CapacityExceeded { .. })));
        assert_eq!(leaf.page(), &before);
    }

    #[test]
    fn test_delete_kv_by_key_rewrites_node() {
        let mut leaf = LeafNode::new(0);
        leaf.put_kv(b"a", b"1").expect("put");
        leaf.put_kv(b"b", b"2").expect("put");
        leaf.put_kv(b"a", b"3").expect("put");
        leaf.put_kv(b"c", b"4").expect("put");

        assert_eq!(leaf.delete_kv_by_key(b"a"), 2);
        assert_eq!(leaf.len(), 2);
        assert_eq!(leaf.free_bytes(), 4070 - 2 * leaf_entry_size(1, 1));
        assert_eq!(leaf.get(b"a"), None);
        assert_eq!(leaf.get(b"c"), Some(b"4".to_vec()));

        assert_eq!(leaf.delete_kv_by_key(b"zzz"), 0);
    }

    #[test]
    fn test_delete_child_by_address_and_key() {
        let mut node = InternalNode::new(0);
        node.put_child(b"b", 2).expect("put");
        node.put_child(b"a", 1).expect("put");
        node.put_child(b"c", 3).expect("put");

        node.delete_child_by_address(2);
        assert_eq!(
            node.children(),
            vec![ChildEntry::new(b"a", 1), ChildEntry::new(b"c", 3)]
        );

        node.delete_child_by_key(b"a");
        assert_eq!(node.children(), vec![ChildEntry::new(b"c", 3)]);
        assert_eq!(node.free_bytes(), 4080 - child_entry_size(1));
    }

    #[test]
    fn test_leaf_split_is_left_biased() {
        let mut leaf = LeafNode::new(9);
        let value = [0xAAu8; 90];
        let mut i = 0u32;
        while leaf.fits(4, value.len()) {
            leaf.put_kv(&be(i * 2), &value).expect("put");
            i += 1;
        }
        let existing = leaf.len();

        let (left, right) = leaf.split(&be(1), &value).expect("split");
        assert_eq!(left.len() + right.len(), existing + 1);
        assert!(left.free_bytes() < leaf_entry_size(4, value.len()));
        assert!(right.len() < left.len());
        assert_eq!(left.parent(), 9);
        assert_eq!(right.parent(), 9);

        let left_max = left.entries().last().map(|e| e.key.clone()).expect("left");
        let right_min = right.first_key().expect("right");
        assert!(left_max < right_min);
        assert_eq!(left.get(&be(1)), Some(value.to_vec()));
    }

    #[test]
    fn test_split_fails_when_three_nodes_needed() {
        let mut leaf = LeafNode::new(0);
        leaf.put_kv(b"a", &[0u8; 2000]).expect("put");
        leaf.put_kv(b"c", &[0u8; 2000]).expect("put");

        let result = leaf.split(b"b", &[0u8; 3000]);
        assert!(matches!(result, Err(NodeError::CapacityExceeded { .. })));
    }

    #[test]
    fn test_internal_split() {
        let mut node = InternalNode::new(0);
        let mut i = 0u32;
        while node.fits(4) {
            node.put_child(&be(i), u64::from(i)).expect("put");
            i += 1;
        }

        let (left, right) = node.split(&be(i), u64::from(i)).expect("split");
        assert_eq!(left.len() + right.len(), node.len() + 1);
        assert_eq!(right.children().last().map(|c| c.page), Some(u64::from(i)));
    }

    #[test]
    fn test_with_overflow_slices_value() {
        let key = b"big";
        let value: Vec<u8> = (0..16_000u32).map(|i| (i % 251) as u8).collect();

        let (leaf, segments) = LeafNode::with_overflow(0, key, &value).expect("overflow");
        let prefix = leaf.get(key).expect("prefix");
        assert_eq!(prefix.len(), 4096 - 26 - 2 - key.len() - 8);
        assert_eq!(leaf.free_bytes(), 0);

        let total: usize = prefix.len() + segments.iter().map(|s| s.data().len()).sum::<usize>();
        assert_eq!(total, value.len());
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].data().len(), SEGMENT_CAPACITY);

        let mut rebuilt = prefix;
        for segment in &segments {
            rebuilt.extend_from_slice(segment.data());
        }
        assert_eq!(rebuilt, value);
    }

    #[test]
    fn test_overflow_leaf_split_keeps_leaf() {
        let (mut leaf, _) = LeafNode::with_overflow(0, b"m", &[1u8; 5000]).expect("overflow");
        leaf.set_overflow_page(Some(12));

        let (left, right) = leaf.split(b"z", b"small").expect("split");
        assert_eq!(left.page(), leaf.page());
        assert_eq!(left.overflow_page(), Some(12));
        assert_eq!(right.get(b"z"), Some(b"small".to_vec()));
    }

    #[test]
    fn test_segment_linking() {
        let mut segment = OverflowSegment::new(b"tail bytes").expect("segment");
        assert_eq!(segment.next(), None);

        segment.set_next(Some(44));
        let decoded = OverflowSegment::from_page(segment.page().clone()).expect("decode");
        assert_eq!(decoded.next(), Some(44));
        assert_eq!(decoded.data(), b"tail bytes");
        assert_eq!(decoded.page().read_u16(0), 2);
        assert_eq!(decoded.page().read_u16(12), 10);

        assert!(OverflowSegment::new(&[0u8; SEGMENT_CAPACITY + 1]).is_err());
    }

    #[test]
    fn test_wire_layout() {
        let mut leaf = LeafNode::new(5);
        leaf.put_kv(b"ab", b"xyz").expect("put");
        let page = leaf.page();

        assert_eq!(page.read_u16(0), 1);
        assert_eq!(page.read_u16(2), 1);
        assert_eq!(page.read_u16(4), 4070 - 15);
        assert_eq!(page.read_u64(6), 5);
        assert_eq!(page.read_u16(14), 26 + 15);
        assert_eq!(page.read_u16(26), 2);
        assert_eq!(page.read_u64(28), 3);
        assert_eq!(page.read_bytes(36, 5), b"abxyz");
    }

    #[test]
    fn test_decode_rejects_bad_pages() {
        let leaf = LeafNode::new(0);
        assert!(matches!(
            InternalNode::from_page(leaf.page().clone()),
            Err(NodeError::WrongNodeType {
                expected: NodeKind::Internal,
                actual: NodeKind::Leaf
            })
        ));

        let mut page = Page::new();
        page.write_u16(0, 9);
        assert!(matches!(
            Node::from_page(page),
            Err(NodeError::InvalidNodeType(9))
        ));

        let mut leaf = LeafNode::new(0);
        leaf.put_kv(b"k", b"v").expect("put");
        let mut page = leaf.into_page();
        page.write_u64(28, u64::MAX);
        assert!(matches!(
            LeafNode::from_page(page),
            Err(NodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_node_decode_dispatch() {
        let mut internal = InternalNode::new(0);
        internal.put_child(b"k", 4).expect("put");
        let node = Node::from_page(internal.into_page()).expect("decode");
        assert_eq!(node.kind(), NodeKind::Internal);

        let node = Node::from_page(LeafNode::new(0).into_page()).expect("decode");
        assert!(matches!(node, Node::Leaf(_)));
    }
}
