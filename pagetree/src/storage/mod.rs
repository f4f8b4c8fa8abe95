//! Page storage for the tree.
//!
//! # File Format
//!
//! The tree lives in a single file of 4KB pages:
//!
//! - Page 0: tree header (root pointer, name, node size limits)
//! - Remaining pages: internal nodes, leaves and leaf overflow segments,
//!   appended in allocation order
//!
//! # Usage
//!
//! ```no_run
//! use pagetree::storage::{FilePageStore, Page, PageStore};
//!
//! let mut store = FilePageStore::create(std::path::Path::new("tree.db"))?;
//! store.write_header(&Page::new())?;
//!
//! let mut page = Page::new();
//! page.write_bytes(0, b"hello");
//! let page_id = store.allocate(&page)?;
//! assert_eq!(page_id, 1);
//!
//! store.sync()?;
//! # Ok::<(), pagetree::storage::StorageError>(())
//! ```

mod file;
mod io;
mod page;

pub use file::FilePageStore;
pub use io::{PageStore, StorageError};
pub use page::{HEADER_PAGE, PAGE_SIZE, PAGE_SIZE_U64, Page, PageId};
