//! Structural consistency checker.
//!
//! Walks every page reachable from a meta record and reports what it finds
//! wrong instead of stopping at the first problem:
//!
//! - bucket pages that are not branch or leaf pages
//! - keys out of order within a page
//! - branch keys that differ from the first key of their child, or subtree
//!   keys outside the range their branch entry covers
//! - empty non-root pages, and non-root branches below the minimum fill
//! - pages reachable twice, reachable and free, or past the high water mark
//! - pages that are neither reachable nor free
//! - duplicate freelist entries
//!
//! The walk reads the memory map directly, so a write transaction checks
//! the state it started from, not its uncommitted pages.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::directory::{BucketHeader, Directory};
use crate::error::{PageId, Result};
use crate::freelist::Freelist;
use crate::page::{MIN_KEYS_PER_PAGE, Meta, Page, PageFlags};
use crate::transaction::TxContext;

/// Outcome of a consistency check.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Number of pages visited.
    pub pages_checked: u64,
    /// Every problem found, in discovery order.
    pub errors: Vec<CheckError>,
}

impl CheckReport {
    /// Whether no problem was found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A single problem found by the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckError {
    /// The page the problem was found on, if it concerns one.
    pub page_id: Option<PageId>,
    /// Slash-separated path of the bucket being walked, if any.
    pub bucket: Option<String>,
    /// Human-readable description.
    pub description: String,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.bucket, self.page_id) {
            (Some(bucket), Some(page)) => write!(f, "bucket {bucket}, page {page}: {}", self.description),
            (Some(bucket), None) => write!(f, "bucket {bucket}: {}", self.description),
            (None, Some(page)) => write!(f, "page {page}: {}", self.description),
            (None, None) => f.write_str(&self.description),
        }
    }
}

/// What a reachable page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Meta,
    Freelist,
    Buckets,
    Tree,
}

struct Checker<'a> {
    map: &'a [u8],
    meta: Meta,
    page_size: usize,
    free: HashSet<PageId>,
    reachable: HashMap<PageId, Owner>,
    report: CheckReport,
}

/// Checks the state `ctx` began from.
pub(crate) fn check(ctx: &TxContext) -> Result<CheckReport> {
    let mut checker = Checker {
        map: &ctx.pager.map,
        meta: ctx.begin_meta,
        page_size: ctx.pager.page_size,
        free: HashSet::new(),
        reachable: HashMap::from([(0, Owner::Meta), (1, Owner::Meta)]),
        report: CheckReport::default(),
    };
    checker.check_freelist();
    if let Some(directory) = checker.check_directory() {
        for (name, header) in directory.iter() {
            checker.check_bucket(&String::from_utf8_lossy(name), header.root);
        }
    }
    checker.check_unreachable();
    Ok(checker.report)
}

impl<'a> Checker<'a> {
    fn error(&mut self, page_id: Option<PageId>, bucket: Option<&str>, description: String) {
        self.report.errors.push(CheckError {
            page_id,
            bucket: bucket.map(str::to_string),
            description,
        });
    }

    /// Loads page `id`, recording it and its overflow run as reachable.
    fn visit(&mut self, id: PageId, owner: Owner, bucket: Option<&str>) -> Option<Page<'a>> {
        if id < 2 || id > self.meta.pgid_hi {
            self.error(Some(id), bucket, format!("page id outside 2..={}", self.meta.pgid_hi));
            return None;
        }
        let page = match Page::in_map(self.map, id, self.page_size) {
            Ok(page) => page,
            Err(e) => {
                self.error(Some(id), bucket, format!("unreadable: {e}"));
                return None;
            }
        };
        self.report.pages_checked += 1;

        let mut fresh = true;
        for run in id..=id + PageId::from(page.overflow()) {
            if let Some(previous) = self.reachable.insert(run, owner) {
                self.error(Some(run), bucket, format!("reachable twice (also from {previous:?})"));
                fresh = false;
            }
            if owner != Owner::Freelist && self.free.contains(&run) {
                self.error(Some(run), bucket, "reachable and free".to_string());
            }
        }
        fresh.then_some(page)
    }

    fn check_freelist(&mut self) {
        let id = self.meta.freelist;
        let Some(page) = self.visit(id, Owner::Freelist, None) else {
            return;
        };
        let freelist = match Freelist::read(page) {
            Ok(freelist) => freelist,
            Err(e) => {
                self.error(Some(id), None, e.to_string());
                return;
            }
        };
        for &free in freelist.free_ids() {
            if !self.free.insert(free) {
                self.error(Some(free), None, "listed twice in the freelist".to_string());
            }
            if free < 2 || free > self.meta.pgid_hi {
                self.error(Some(free), None, format!("free id outside 2..={}", self.meta.pgid_hi));
            }
            if self.reachable.get(&free) == Some(&Owner::Freelist) {
                self.error(Some(free), None, "freelist lists its own page".to_string());
            }
        }
    }

    fn check_directory(&mut self) -> Option<Directory> {
        let id = self.meta.buckets;
        let page = self.visit(id, Owner::Buckets, None)?;
        match Directory::read(page) {
            Ok(directory) => Some(directory),
            Err(e) => {
                self.error(Some(id), None, e.to_string());
                None
            }
        }
    }

    fn check_bucket(&mut self, bucket: &str, root: PageId) {
        self.check_tree(bucket, root, true, None, None);
    }

    /// Checks the subtree at `id`, whose keys must lie in `[low, high)`.
    /// Returns its first key.
    fn check_tree(
        &mut self,
        bucket: &str,
        id: PageId,
        is_root: bool,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Option<Vec<u8>> {
        let page = self.visit(id, Owner::Tree, Some(bucket))?;
        let flags = page.flags();
        if flags != PageFlags::BRANCH && flags != PageFlags::LEAF {
            self.error(Some(id), Some(bucket), format!("{} page inside a bucket", flags.kind()));
            return None;
        }
        if !page.elements_in_bounds() {
            self.error(Some(id), Some(bucket), "elements overrun the page".to_string());
            return None;
        }

        let count = page.count() as usize;
        if count == 0 && !is_root {
            self.error(Some(id), Some(bucket), format!("empty non-root {} page", flags.kind()));
            return None;
        }
        if flags == PageFlags::BRANCH && !is_root && count < MIN_KEYS_PER_PAGE {
            self.error(
                Some(id),
                Some(bucket),
                format!("non-root branch page holds {count} entries, fewer than {MIN_KEYS_PER_PAGE}"),
            );
        }

        let keys: Vec<&[u8]> = (0..count).map(|i| page.key_at(i)).collect();
        for pair in keys.windows(2) {
            if pair[0] >= pair[1] {
                self.error(
                    Some(id),
                    Some(bucket),
                    format!("keys out of order: {:?} before {:?}", String::from_utf8_lossy(pair[0]), String::from_utf8_lossy(pair[1])),
                );
            }
        }
        for key in &keys {
            if low.is_some_and(|low| *key < low) || high.is_some_and(|high| *key >= high) {
                self.error(
                    Some(id),
                    Some(bucket),
                    format!("key {:?} outside the range of its branch entry", String::from_utf8_lossy(key)),
                );
            }
        }

        if page.is_leaf() {
            for i in 0..count {
                let elem = page.leaf_element(i);
                if !elem.is_bucket() {
                    continue;
                }
                let path = format!("{bucket}/{}", String::from_utf8_lossy(elem.key));
                match BucketHeader::from_bytes(elem.value) {
                    Ok(header) => self.check_bucket(&path, header.root),
                    Err(e) => self.error(Some(id), Some(bucket), format!("nested bucket {path}: {e}")),
                }
            }
        } else {
            for i in 0..count {
                let elem = page.branch_element(i);
                let next = keys.get(i + 1).copied().or(high);
                let first = self.check_tree(bucket, elem.pgid, false, Some(elem.key), next);
                if let Some(first) = first.filter(|first| first.as_slice() != elem.key) {
                    self.error(
                        Some(id),
                        Some(bucket),
                        format!(
                            "branch key {:?} differs from first key {:?} of page {}",
                            String::from_utf8_lossy(elem.key),
                            String::from_utf8_lossy(&first),
                            elem.pgid
                        ),
                    );
                }
            }
        }
        keys.first().map(|key| key.to_vec())
    }

    fn check_unreachable(&mut self) {
        for id in 2..=self.meta.pgid_hi {
            if !self.reachable.contains_key(&id) && !self.free.contains(&id) {
                self.error(Some(id), None, "unreachable and not free".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::db::{Database, DatabaseOptions};
    use crate::error::Error;
    use crate::page::{
        BRANCH_ELEMENT_SIZE, DEFAULT_PAGE_SIZE, LEAF_ELEMENT_SIZE, PAGE_HEADER_SIZE, PageHeader, PageMut,
    };

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::open_with_options(
            dir.path().join("check.db"),
            DatabaseOptions::builder().no_sync(true).build(),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_database_is_consistent() {
        let dir = tempdir().unwrap();
        let db = open(&dir);
        let report = db.check().unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.pages_checked, 2);
    }

    #[test]
    fn test_populated_database_is_consistent() {
        let dir = tempdir().unwrap();
        let db = open(&dir);
        db.update(|tx| {
            let mut bucket = tx.create_bucket(b"items")?;
            for i in 0..1000u32 {
                bucket.put(format!("{i:06}").as_bytes(), &[1u8; 40])?;
            }
            let mut nested = bucket.create_bucket(b"nested")?;
            nested.put(b"a", b"1")?;
            Ok::<_, Error>(())
        })
        .unwrap();
        db.update(|tx| {
            let mut bucket = tx.bucket_mut(b"items")?.ok_or(Error::BucketNotFound)?;
            for i in (0..1000u32).step_by(3) {
                bucket.delete(format!("{i:06}").as_bytes())?;
            }
            Ok::<_, Error>(())
        })
        .unwrap();

        let report = db.check().unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.pages_checked > 10);
    }

    #[test]
    fn test_writer_checks_its_starting_state() {
        let dir = tempdir().unwrap();
        let db = open(&dir);
        let mut tx = db.begin_write().unwrap();
        tx.create_bucket(b"pending").unwrap().put(b"k", b"v").unwrap();
        let report = tx.check().unwrap();
        assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn test_detects_keys_out_of_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check.db");
        let root = {
            let db = open(&dir);
            db.update(|tx| {
                let mut bucket = tx.create_bucket(b"b")?;
                bucket.put(b"aa", b"1")?;
                bucket.put(b"bb", b"2")
            })
            .unwrap();
            let tx = db.begin_read().unwrap();
            let root = tx.bucket(b"b").unwrap().root();
            root
        };

        // Leaf data follows the elements as key, value, key, value:
        // "aa" "1" "bb" "2". Swapping the first key bytes gives "ba", "ab".
        let mut bytes = std::fs::read(&path).unwrap();
        let data = root as usize * DEFAULT_PAGE_SIZE + PAGE_HEADER_SIZE + 2 * LEAF_ELEMENT_SIZE;
        bytes.swap(data, data + 3);
        std::fs::write(&path, bytes).unwrap();

        let db = open(&dir);
        let report = db.check().unwrap();
        assert!(report.errors.iter().any(|e| e.description.contains("out of order")), "{:?}", report.errors);
        assert!(report.errors.iter().all(|e| e.bucket.as_deref() == Some("b")));
    }

    #[test]
    fn test_detects_leaked_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check.db");
        drop(open(&dir));

        // A newer meta claiming page 4 without referencing or freeing it.
        let mut bytes = std::fs::read(&path).unwrap();
        let mut meta = Meta::new(DEFAULT_PAGE_SIZE as u32, 2, 2, 3, 4);
        meta.write_page(&mut bytes[..DEFAULT_PAGE_SIZE]);
        std::fs::write(&path, bytes).unwrap();

        let db = open(&dir);
        let report = db.check().unwrap();
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert_eq!(report.errors[0].page_id, Some(4));
        assert!(report.errors[0].description.contains("unreachable"));
    }

    #[test]
    fn test_detects_underfilled_branch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check.db");
        let root = {
            let db = open(&dir);
            db.update(|tx| {
                let mut bucket = tx.create_bucket(b"b")?;
                for i in 0..1000u32 {
                    bucket.put(format!("{i:06}").as_bytes(), &[1u8; 40])?;
                }
                Ok::<_, Error>(())
            })
            .unwrap();
            let tx = db.begin_read().unwrap();
            let root = tx.bucket(b"b").unwrap().root();
            root
        };

        let page_size = DEFAULT_PAGE_SIZE;
        let mut bytes = std::fs::read(&path).unwrap();
        let live = [0usize, 1]
            .iter()
            .map(|slot| Meta::from_bytes(&bytes[slot * page_size + PAGE_HEADER_SIZE..]).unwrap())
            .max_by_key(|meta| meta.txid)
            .unwrap();

        // Slot a single-entry branch between the root and its first leaf.
        let root_at = root as usize * page_size;
        let (key, leaf) = {
            let page = Page::from_bytes(&bytes[root_at..root_at + page_size]).unwrap();
            assert!(page.is_branch());
            let elem = page.branch_element(0);
            (elem.key.to_vec(), elem.pgid)
        };
        let wrapper = live.pgid_hi + 1;
        let at = wrapper as usize * page_size;
        if bytes.len() < at + page_size {
            bytes.resize(at + page_size, 0);
        }
        let mut page = PageMut::new(&mut bytes[at..at + page_size]);
        page.set_header(&PageHeader { id: wrapper, flags: PageFlags::BRANCH, count: 1, overflow: 0 });
        page.put_branch_element(0, PAGE_HEADER_SIZE + BRANCH_ELEMENT_SIZE, &key, leaf);
        let pgid_at = root_at + PAGE_HEADER_SIZE + 8;
        bytes[pgid_at..pgid_at + 8].copy_from_slice(&wrapper.to_le_bytes());

        let mut meta = Meta::new(page_size as u32, live.txid + 1, live.freelist, live.buckets, wrapper);
        let slot = meta.slot() as usize;
        meta.write_page(&mut bytes[slot * page_size..(slot + 1) * page_size]);
        std::fs::write(&path, bytes).unwrap();

        let db = open(&dir);
        let report = db.check().unwrap();
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert_eq!(report.errors[0].page_id, Some(wrapper));
        assert_eq!(report.errors[0].bucket.as_deref(), Some("b"));
        assert!(report.errors[0].description.contains("fewer than 2"));
    }

    #[test]
    fn test_error_display() {
        let err = CheckError { page_id: Some(7), bucket: Some("a/b".to_string()), description: "bad".to_string() };
        assert_eq!(err.to_string(), "bucket a/b, page 7: bad");
        let err = CheckError { page_id: None, bucket: None, description: "bad".to_string() };
        assert_eq!(err.to_string(), "bad");
    }
}
