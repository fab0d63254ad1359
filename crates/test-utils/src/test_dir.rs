//! Scratch directory holding one data file per test.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// File name of the data file inside every [`TestDir`].
pub const DB_FILE_NAME: &str = "test.db";

/// A temporary directory for one database file, removed on drop.
///
/// Besides the path, it exposes the raw file image so tests can inspect or
/// rewrite pages of a closed database.
///
/// # Example
///
/// ```
/// use inkvault_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// dir.write_db_bytes(&[0u8; 4 * 1024]);
/// assert_eq!(dir.page(1024, 3).len(), 1024);
/// assert!(dir.db_path().starts_with(dir.path()));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates an empty directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let inner = TempDir::new().expect("failed to create temp directory");
        Self { inner }
    }

    /// The directory itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Path of the data file. Nothing is created until a database is opened.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.inner.path().join(DB_FILE_NAME)
    }

    /// Whole data file image.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be read.
    #[must_use]
    pub fn db_bytes(&self) -> Vec<u8> {
        fs::read(self.db_path()).expect("failed to read data file")
    }

    /// Replaces the data file with `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write_db_bytes(&self, bytes: &[u8]) {
        fs::write(self.db_path(), bytes).expect("failed to write data file");
    }

    /// Bytes of page `id` for a file of `page_size` pages.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be read or is shorter than the page.
    #[must_use]
    pub fn page(&self, page_size: usize, id: u64) -> Vec<u8> {
        let start = id as usize * page_size;
        let bytes = self.db_bytes();
        bytes.get(start..start + page_size).expect("page past end of data file").to_vec()
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
