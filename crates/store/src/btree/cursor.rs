//! Cursor over one bucket's B+tree.
//!
//! The cursor keeps a stack of `(page or node, index)` entries from the root
//! to the current leaf position. A level is read from the transaction's
//! materialised node when one exists for that page, otherwise straight from
//! the page, so a write transaction sees its own uncommitted changes.
//!
//! Leaves emptied by deletes are skipped during iteration; they only go away
//! at commit.

use super::node::{Node, NodeArena};
use super::{PageProvider, TreeNodes};
use crate::error::{Error, PageId, Result};
use crate::page::{LeafFlags, Page, PageFlags};

/// One item yielded by a cursor: the key and, unless the entry is a nested
/// bucket, its value.
pub type CursorItem<'tx> = (&'tx [u8], Option<&'tx [u8]>);

#[derive(Clone, Copy)]
enum Level<'tx> {
    Page(Page<'tx>),
    Node(&'tx Node),
}

impl<'tx> Level<'tx> {
    fn count(&self) -> usize {
        match *self {
            Level::Page(page) => page.count() as usize,
            Level::Node(node) => node.inodes.len(),
        }
    }

    fn is_leaf(&self) -> bool {
        match *self {
            Level::Page(page) => page.is_leaf(),
            Level::Node(node) => node.is_leaf,
        }
    }

    fn key(&self, index: usize) -> &'tx [u8] {
        match *self {
            Level::Page(page) => page.key_at(index),
            Level::Node(node) => node.inodes[index].key(),
        }
    }

    fn child(&self, index: usize) -> PageId {
        match *self {
            Level::Page(page) => page.branch_element(index).pgid,
            Level::Node(node) => node.inodes[index].pgid,
        }
    }

    fn entry(&self, index: usize) -> (&'tx [u8], &'tx [u8], LeafFlags) {
        match *self {
            Level::Page(page) => {
                let elem = page.leaf_element(index);
                (elem.key, elem.value, elem.flags)
            }
            Level::Node(node) => {
                let inode = &node.inodes[index];
                (inode.key(), inode.value(), inode.flags)
            }
        }
    }

    /// Leaf: first index with key ≥ `key`. Branch: index of the child
    /// covering `key`, i.e. the last separator ≤ `key`.
    fn search(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Equal if !self.is_leaf() => return mid,
                _ => hi = mid,
            }
        }
        if self.is_leaf() { lo } else { lo.saturating_sub(1) }
    }
}

#[derive(Clone, Copy)]
struct StackEntry<'tx> {
    level: Level<'tx>,
    index: usize,
}

/// Positional iterator over a bucket.
///
/// Obtained from [`crate::Bucket::cursor`]; it borrows the transaction and is
/// only valid while it is open. Every movement returns the entry it lands
/// on, or `None` once it runs off either end.
pub struct Cursor<'tx> {
    pages: &'tx dyn PageProvider,
    arena: &'tx NodeArena,
    tree: Option<&'tx TreeNodes>,
    root: PageId,
    stack: Vec<StackEntry<'tx>>,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(
        pages: &'tx dyn PageProvider,
        arena: &'tx NodeArena,
        tree: Option<&'tx TreeNodes>,
        root: PageId,
    ) -> Self {
        Self { pages, arena, tree, root, stack: Vec::new() }
    }

    /// Moves to the first entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn first(&mut self) -> Result<Option<CursorItem<'tx>>> {
        self.stack.clear();
        let root = self.level(self.root)?;
        self.stack.push(StackEntry { level: root, index: 0 });
        self.descend_first()?;
        if self.top_count() == 0 {
            return self.next();
        }
        Ok(self.current())
    }

    /// Moves to the last entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn last(&mut self) -> Result<Option<CursorItem<'tx>>> {
        self.stack.clear();
        let root = self.level(self.root)?;
        self.stack.push(StackEntry { level: root, index: root.count().saturating_sub(1) });
        self.descend_last()?;
        if self.top_count() == 0 {
            return self.prev();
        }
        Ok(self.current())
    }

    /// Moves to the entry after the current one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<CursorItem<'tx>>> {
        loop {
            let Some(depth) =
                self.stack.iter().rposition(|entry| entry.index + 1 < entry.level.count())
            else {
                self.stack.clear();
                return Ok(None);
            };
            self.stack.truncate(depth + 1);
            self.stack[depth].index += 1;
            self.descend_first()?;
            if self.top_count() > 0 {
                return Ok(self.current());
            }
        }
    }

    /// Moves to the entry before the current one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn prev(&mut self) -> Result<Option<CursorItem<'tx>>> {
        loop {
            let Some(depth) = self.stack.iter().rposition(|entry| entry.index > 0) else {
                self.stack.clear();
                return Ok(None);
            };
            self.stack.truncate(depth + 1);
            self.stack[depth].index -= 1;
            self.descend_last()?;
            if self.top_count() > 0 {
                return Ok(self.current());
            }
        }
    }

    /// Moves to the first entry with key ≥ `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<CursorItem<'tx>>> {
        self.seek_raw(key)?;
        if self.stack.last().is_some_and(|top| top.index >= top.level.count()) {
            return self.next();
        }
        Ok(self.current())
    }

    /// Value stored under exactly `key`. Nested buckets read as absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<&'tx [u8]>> {
        match self.seek_raw(key)? {
            Some((found, value, flags)) if found == key && !flags.contains(LeafFlags::BUCKET) => {
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Positions on the leaf slot where `key` is or would be, without
    /// stepping past the end of the leaf. Returns the entry at that slot.
    pub(crate) fn seek_raw(
        &mut self,
        key: &[u8],
    ) -> Result<Option<(&'tx [u8], &'tx [u8], LeafFlags)>> {
        self.stack.clear();
        let mut pgid = self.root;
        loop {
            let level = self.level(pgid)?;
            let index = level.search(key);
            self.stack.push(StackEntry { level, index });
            if level.is_leaf() {
                break;
            }
            if level.count() == 0 {
                return Err(Error::Corrupted { reason: format!("branch page {pgid} is empty") });
            }
            pgid = level.child(index);
        }
        Ok(self.stack.last().filter(|top| top.index < top.level.count()).map(|top| top.level.entry(top.index)))
    }

    /// Branch indices from the root down to the leaf `key` belongs in.
    #[cfg(test)]
    pub(crate) fn seek_path(&mut self, key: &[u8]) -> Result<Vec<usize>> {
        self.seek_raw(key)?;
        Ok(self.path())
    }

    /// Branch indices of the current position.
    pub(crate) fn path(&self) -> Vec<usize> {
        let branches = self.stack.len().saturating_sub(1);
        self.stack[..branches].iter().map(|entry| entry.index).collect()
    }

    /// Entry under the cursor, including its leaf flags.
    pub(crate) fn current_raw(&self) -> Option<(&'tx [u8], &'tx [u8], LeafFlags)> {
        self.stack
            .last()
            .filter(|top| top.level.is_leaf() && top.index < top.level.count())
            .map(|top| top.level.entry(top.index))
    }

    fn current(&self) -> Option<CursorItem<'tx>> {
        self.current_raw().map(|(key, value, flags)| {
            if flags.contains(LeafFlags::BUCKET) { (key, None) } else { (key, Some(value)) }
        })
    }

    fn top_count(&self) -> usize {
        self.stack.last().map_or(0, |top| top.level.count())
    }

    fn descend_first(&mut self) -> Result<()> {
        while let Some(top) = self.stack.last().copied() {
            if top.level.is_leaf() || top.level.count() == 0 {
                break;
            }
            let level = self.level(top.level.child(top.index))?;
            self.stack.push(StackEntry { level, index: 0 });
        }
        Ok(())
    }

    fn descend_last(&mut self) -> Result<()> {
        while let Some(top) = self.stack.last().copied() {
            if top.level.is_leaf() || top.level.count() == 0 {
                break;
            }
            let level = self.level(top.level.child(top.index))?;
            self.stack.push(StackEntry { level, index: level.count().saturating_sub(1) });
        }
        Ok(())
    }

    fn level(&self, pgid: PageId) -> Result<Level<'tx>> {
        let arena: &'tx NodeArena = self.arena;
        if let Some(node) =
            self.tree.and_then(|tree| tree.nodes.get(&pgid)).and_then(|&id| arena.get(id))
        {
            return Ok(Level::Node(node));
        }

        let pages: &'tx dyn PageProvider = self.pages;
        let page = pages.page(pgid)?;
        let flags = page.flags();
        if flags != PageFlags::BRANCH && flags != PageFlags::LEAF {
            return Err(Error::Corrupted {
                reason: format!("page {pgid} is a {} page, expected branch or leaf", flags.kind()),
            });
        }
        if !page.elements_in_bounds() {
            return Err(Error::Corrupted {
                reason: format!("page {pgid} has elements outside its bounds"),
            });
        }
        Ok(Level::Page(page))
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("root", &self.root).field("depth", &self.stack.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use memmap2::Mmap;

    use super::*;
    use crate::btree::node::NodeBytes;
    use crate::page::{PageHeader, PageMut};

    /// Fixed set of pre-built pages.
    #[derive(Default)]
    struct StaticPages {
        pages: BTreeMap<PageId, Vec<u8>>,
    }

    impl StaticPages {
        fn add(&mut self, pgid: PageId, node: &Node) {
            let mut buf = vec![0u8; 4096];
            PageMut::new(&mut buf).set_header(&PageHeader::new(pgid, PageFlags::LEAF));
            node.write(&mut buf);
            self.pages.insert(pgid, buf);
        }
    }

    impl PageProvider for StaticPages {
        fn page(&self, id: PageId) -> Result<Page<'_>> {
            match self.pages.get(&id) {
                Some(buf) => Page::from_bytes(buf),
                None => Err(Error::Corrupted { reason: format!("missing page {id}") }),
            }
        }

        fn mapped(&self) -> Option<&Arc<Mmap>> {
            None
        }

        fn page_size(&self) -> usize {
            4096
        }

        fn allocate(&mut self, _count: usize) -> Result<PageId> {
            Err(Error::TxNotWritable)
        }

        fn page_mut(&mut self, _id: PageId) -> Result<&mut [u8]> {
            Err(Error::TxNotWritable)
        }

        fn free(&mut self, _id: PageId) -> Result<()> {
            Err(Error::TxNotWritable)
        }
    }

    fn leaf(entries: &[(&str, &str)]) -> Node {
        let mut node = Node { is_leaf: true, ..Node::default() };
        for (key, value) in entries {
            node.put(key.as_bytes(), key.as_bytes().into(), value.as_bytes().into(), 0, LeafFlags::empty());
        }
        node
    }

    fn branch(children: &[(&str, PageId)]) -> Node {
        let mut node = Node { is_leaf: false, ..Node::default() };
        for (key, pgid) in children {
            node.put(key.as_bytes(), key.as_bytes().into(), NodeBytes::default(), *pgid, LeafFlags::empty());
        }
        node
    }

    /// Root 3 → leaves 4 ("a".."c"), 5 (empty), 6 ("m".."o").
    fn two_level() -> StaticPages {
        let mut pages = StaticPages::default();
        pages.add(4, &leaf(&[("a", "1"), ("b", "2"), ("c", "3")]));
        pages.add(5, &leaf(&[]));
        pages.add(6, &leaf(&[("m", "4"), ("n", "5"), ("o", "6")]));
        pages.add(3, &branch(&[("a", 4), ("f", 5), ("m", 6)]));
        pages
    }

    fn keys_forward(cursor: &mut Cursor<'_>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut item = cursor.first().unwrap();
        while let Some((key, _)) = item {
            out.push(key.to_vec());
            item = cursor.next().unwrap();
        }
        out
    }

    #[test]
    fn test_forward_iteration_skips_empty_leaf() {
        let pages = two_level();
        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 3);
        let keys = keys_forward(&mut cursor);
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"m".to_vec(), b"n".to_vec(), b"o".to_vec()]);
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn test_backward_iteration() {
        let pages = two_level();
        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 3);
        let mut keys = Vec::new();
        let mut item = cursor.last().unwrap();
        while let Some((key, _)) = item {
            keys.push(key.to_vec());
            item = cursor.prev().unwrap();
        }
        assert_eq!(keys, vec![b"o".to_vec(), b"n".to_vec(), b"m".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_seek() {
        let pages = two_level();
        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 3);

        assert_eq!(cursor.seek(b"b").unwrap(), Some((&b"b"[..], Some(&b"2"[..]))));
        assert_eq!(cursor.seek(b"bb").unwrap().map(|(k, _)| k), Some(&b"c"[..]));
        // Past the end of leaf 4, across the empty leaf, into leaf 6.
        assert_eq!(cursor.seek(b"d").unwrap().map(|(k, _)| k), Some(&b"m"[..]));
        assert_eq!(cursor.seek(b"0").unwrap().map(|(k, _)| k), Some(&b"a"[..]));
        assert!(cursor.seek(b"z").unwrap().is_none());
    }

    #[test]
    fn test_get_exact_only() {
        let pages = two_level();
        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 3);
        assert_eq!(cursor.get(b"n").unwrap(), Some(&b"5"[..]));
        assert_eq!(cursor.get(b"nn").unwrap(), None);
        assert_eq!(cursor.get(b"").unwrap(), None);
    }

    #[test]
    fn test_seek_path_picks_covering_child() {
        let pages = two_level();
        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 3);
        assert_eq!(cursor.seek_path(b"0").unwrap(), vec![0]);
        assert_eq!(cursor.seek_path(b"c").unwrap(), vec![0]);
        assert_eq!(cursor.seek_path(b"g").unwrap(), vec![1]);
        assert_eq!(cursor.seek_path(b"m").unwrap(), vec![2]);
        assert_eq!(cursor.seek_path(b"zzz").unwrap(), vec![2]);
    }

    #[test]
    fn test_materialised_node_shadows_page() {
        let pages = two_level();
        let mut arena = NodeArena::default();
        let mut node = leaf(&[("m", "4"), ("n", "5"), ("o", "6")]);
        node.pgid = 6;
        node.del(b"n");
        node.put(b"p", b"p".as_slice().into(), b"7".as_slice().into(), 0, LeafFlags::empty());
        let id = arena.insert(node);
        let mut tree = TreeNodes::default();
        tree.nodes.insert(6, id);

        let mut cursor = Cursor::new(&pages, &arena, Some(&tree), 3);
        let keys = keys_forward(&mut cursor);
        assert_eq!(keys.last().map(Vec::as_slice), Some(&b"p"[..]));
        assert!(!keys.contains(&b"n".to_vec()));
    }

    #[test]
    fn test_bucket_entries_have_no_value() {
        let mut pages = StaticPages::default();
        let mut node = leaf(&[("plain", "v")]);
        node.put(b"sub", b"sub".as_slice().into(), vec![0u8; 16].into(), 0, LeafFlags::BUCKET);
        pages.add(2, &node);

        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 2);
        assert_eq!(cursor.first().unwrap(), Some((&b"plain"[..], Some(&b"v"[..]))));
        assert_eq!(cursor.next().unwrap(), Some((&b"sub"[..], None)));
        assert_eq!(cursor.get(b"sub").unwrap(), None);
    }

    #[test]
    fn test_empty_tree() {
        let mut pages = StaticPages::default();
        pages.add(2, &leaf(&[]));
        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 2);
        assert!(cursor.first().unwrap().is_none());
        assert!(cursor.last().unwrap().is_none());
        assert!(cursor.seek(b"a").unwrap().is_none());
    }

    #[test]
    fn test_non_tree_page_is_corruption() {
        let mut pages = StaticPages::default();
        let mut buf = vec![0u8; 4096];
        PageMut::new(&mut buf).set_header(&PageHeader::new(2, PageFlags::FREELIST));
        pages.pages.insert(2, buf);
        let arena = NodeArena::default();
        let mut cursor = Cursor::new(&pages, &arena, None, 2);
        assert!(matches!(cursor.first(), Err(Error::Corrupted { .. })));
    }
}
