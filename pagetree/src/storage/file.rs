//! File-backed page store.
//!
//! Page `n` lives at byte offset `n * PAGE_SIZE`. New pages are appended at
//! the end of the file, so a page number is simply the file length in pages
//! at the moment it was allocated.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::{HEADER_PAGE, PAGE_SIZE_U64, Page, PageId};

/// A single database file holding the tree header and its nodes.
pub struct FilePageStore {
    file: File,
    path: PathBuf,
    total_pages: u64,
}

impl FilePageStore {
    /// Create a new, empty database file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            return Err(StorageError::AlreadyExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        tracing::info!(path = %path.display(), "created page file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_pages: 0,
        })
    }

    /// Open an existing database file.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len % PAGE_SIZE_U64 != 0 {
            return Err(StorageError::TruncatedFile { len });
        }
        let total_pages = len / PAGE_SIZE_U64;

        tracing::info!(path = %path.display(), total_pages, "opened page file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_pages,
        })
    }

    /// Open the file if it exists, otherwise create it.
    pub fn open_or_create(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_bounds(&self, page_id: PageId) -> Result<(), StorageError> {
        if page_id >= self.total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: self.total_pages,
            });
        }
        Ok(())
    }

    fn write_at(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        self.file.seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))?;
        self.file.write_all(page.as_bytes())?;
        Ok(())
    }
}

impl PageStore for FilePageStore {
    fn read(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        self.check_bounds(page_id)?;

        let mut page = Page::new();
        self.file.seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))?;
        self.file.read_exact(page.as_bytes_mut())?;

        Ok(page)
    }

    fn allocate(&mut self, page: &Page) -> Result<PageId, StorageError> {
        let page_id = self.total_pages;
        self.write_at(page_id, page)?;
        self.total_pages += 1;
        Ok(page_id)
    }

    fn write(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        self.check_bounds(page_id)?;
        self.write_at(page_id, page)
    }

    fn write_header(&mut self, page: &Page) -> Result<(), StorageError> {
        if self.total_pages == 0 {
            // The header page is the first page ever appended.
            self.total_pages = 1;
        }
        self.write_at(HEADER_PAGE, page)
    }

    fn total_pages(&self) -> u64 {
        self.total_pages
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");

        {
            let mut store = FilePageStore::create(&path).expect("create store");
            assert_eq!(store.total_pages(), 0);

            let mut header = Page::new();
            header.write_u64(0, 42);
            store.write_header(&header).expect("write header");
            store.sync().expect("sync");
        }

        assert!(matches!(
            FilePageStore::create(&path),
            Err(StorageError::AlreadyExists(_))
        ));

        let mut store = FilePageStore::open(&path).expect("open store");
        assert_eq!(store.total_pages(), 1);
        assert_eq!(store.read(0).expect("read header").read_u64(0), 42);
    }

    #[test]
    fn test_allocate_returns_file_length_in_pages() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("alloc.db");
        let mut store = FilePageStore::create(&path).expect("create store");
        store.write_header(&Page::new()).expect("write header");

        let mut page = Page::new();
        for expected in 1..=3u64 {
            page.write_u64(100, expected * 10);
            let page_id = store.allocate(&page).expect("allocate");
            assert_eq!(page_id, expected);
        }

        assert_eq!(store.total_pages(), 4);
        assert_eq!(store.read(2).expect("read").read_u64(100), 20);

        let len = std::fs::metadata(store.path()).expect("metadata").len();
        assert_eq!(len, 4 * PAGE_SIZE_U64);
    }

    #[test]
    fn test_write_in_place_and_bounds() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("rw.db");
        let mut store = FilePageStore::create(&path).expect("create store");
        store.write_header(&Page::new()).expect("write header");
        let page_id = store.allocate(&Page::new()).expect("allocate");

        let mut page = Page::new();
        page.write_bytes(10, b"rewritten");
        store.write(page_id, &page).expect("write");
        assert_eq!(store.read(page_id).expect("read").read_bytes(10, 9), b"rewritten");

        assert!(matches!(
            store.read(9),
            Err(StorageError::PageOutOfBounds { page_id: 9, total_pages: 2 })
        ));
        assert!(store.write(5, &page).is_err());
        assert!(matches!(store.delete(page_id), Err(StorageError::Unsupported(_))));
    }

    #[test]
    fn test_open_rejects_partial_page() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("short.db");
        std::fs::write(&path, [0u8; 100]).expect("write file");

        assert!(matches!(
            FilePageStore::open(&path),
            Err(StorageError::TruncatedFile { len: 100 })
        ));
    }
}
