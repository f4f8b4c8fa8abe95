//! Tree header structure and serialization.
//!
//! The header occupies page 0 and records where the root lives.

// Node size limits are bounded by PAGE_SIZE, which fits in u16.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::{PAGE_SIZE, Page, PageId};

/// Maximum length of a tree name in bytes.
pub const MAX_NAME_LEN: usize = 400;

/// Name given to trees bootstrapped without an explicit name.
pub const DEFAULT_TREE_NAME: &str = "bTree";

/// Header field offsets.
mod offsets {
    pub const ROOT: usize = 0;
    // 8-15: reserved
    pub const NAME: usize = 16;
    pub const MIN_NODE_SIZE: usize = 416;
    pub const MAX_NODE_SIZE: usize = 418;
}

/// The tree's metadata page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHeader {
    /// Page of the root node, or 0 when the tree is empty.
    pub root: PageId,
    /// Human-readable tree name.
    pub name: String,
    /// Stored for on-disk compatibility only. Nodes are unlinked when they
    /// become empty, whatever this holds.
    pub min_node_size: u16,
    /// Maximum node size in bytes.
    pub max_node_size: u16,
}

impl TreeHeader {
    /// Create a header for a new, empty tree.
    pub fn new(name: &str) -> Result<Self, HeaderError> {
        if name.len() > MAX_NAME_LEN {
            return Err(HeaderError::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }

        Ok(Self {
            root: 0,
            name: name.to_string(),
            min_node_size: 1,
            max_node_size: PAGE_SIZE as u16,
        })
    }

    /// Whether the tree holds no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Serialize the header into a page.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::new();
        page.write_u64(offsets::ROOT, self.root);
        // Names are validated on construction; truncation only guards
        // against a caller mutating the public field.
        let name = &self.name.as_bytes()[..self.name.len().min(MAX_NAME_LEN)];
        page.write_bytes(offsets::NAME, name);
        page.write_u16(offsets::MIN_NODE_SIZE, self.min_node_size);
        page.write_u16(offsets::MAX_NODE_SIZE, self.max_node_size);
        page
    }

    /// Deserialize a header from a page.
    pub fn from_page(page: &Page) -> Result<Self, HeaderError> {
        let raw_name = page.read_bytes(offsets::NAME, MAX_NAME_LEN);
        let name_len = raw_name
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        let name = std::str::from_utf8(&raw_name[..name_len])
            .map_err(|_| HeaderError::InvalidName)?
            .to_string();

        Ok(Self {
            root: page.read_u64(offsets::ROOT),
            name,
            min_node_size: page.read_u16(offsets::MIN_NODE_SIZE),
            max_node_size: page.read_u16(offsets::MAX_NODE_SIZE),
        })
    }
}

/// Errors related to the tree header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Name does not fit in the header.
    NameTooLong { len: usize, max: usize },
    /// Stored name is not valid UTF-8.
    InvalidName,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameTooLong { len, max } => {
                write!(f, "tree name is {len} bytes, at most {max} allowed")
            }
            Self::InvalidName => write!(f, "tree name is not valid UTF-8"),
        }
    }
}

impl std::error::Error for HeaderError {}
