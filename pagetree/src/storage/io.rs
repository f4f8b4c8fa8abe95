//! Page store abstraction consumed by the tree.
//!
//! The tree never touches a file directly. It reads, allocates and writes
//! whole pages through a `PageStore`, which lets the same tree code run over
//! a real file in production and over simulated in-memory storage in tests.
//!
//! # Implementation Notes
//!
//! Implementations must ensure:
//! - `read` returns the last written content for a page
//! - `allocate` appends exactly one page and returns its page number, which
//!   equals the number of pages held before the call
//! - `write_header` overwrites page 0 and nothing else

use std::path::PathBuf;

use crate::storage::page::{Page, PageId};

/// Errors that can occur during page store operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Page out of bounds.
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
    /// File already exists.
    AlreadyExists(PathBuf),
    /// File length is not a whole number of pages.
    TruncatedFile { len: u64 },
    /// Operation not provided by this store.
    Unsupported(&'static str),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => write!(
                f,
                "page {page_id} out of bounds (total pages: {total_pages})"
            ),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::TruncatedFile { len } => {
                write!(f, "file length {len} is not a multiple of the page size")
            }
            Self::Unsupported(op) => write!(f, "unsupported page store operation: {op}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over page-based storage.
///
/// The tree only relies on `read`, `allocate`, `write` and `write_header`.
/// Any failure aborts the operation in progress; the tree does not retry.
pub trait PageStore {
    /// Read the persisted bytes of a page.
    fn read(&mut self, page_id: PageId) -> Result<Page, StorageError>;

    /// Append a new page holding `page` and return its page number.
    fn allocate(&mut self, page: &Page) -> Result<PageId, StorageError>;

    /// Overwrite an existing page in place.
    fn write(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError>;

    /// Overwrite the tree header (page 0).
    fn write_header(&mut self, page: &Page) -> Result<(), StorageError>;

    /// Release a page.
    ///
    /// No page reclamation exists yet, so stores reject this by default.
    fn delete(&mut self, page_id: PageId) -> Result<(), StorageError> {
        let _ = page_id;
        Err(StorageError::Unsupported("delete"))
    }

    /// Number of pages currently held, including the header page.
    fn total_pages(&self) -> u64;

    /// Make all previous writes durable.
    fn sync(&mut self) -> Result<(), StorageError>;
}
