//! Buckets: named, ordered key/value namespaces.
//!
//! A bucket is one B+tree. Top-level buckets are listed in the buckets
//! directory; nested buckets live as leaf entries flagged
//! [`LeafFlags::BUCKET`] in their parent's tree, with a [`BucketHeader`] as
//! the value.
//!
//! Read access goes through [`Bucket`], a copyable handle borrowing the
//! transaction. Write access goes through [`BucketMut`], which borrows the
//! transaction mutably. A bucket touched for writing gets a `BucketState`
//! in the transaction holding its materialised nodes until commit.

use std::collections::BTreeMap;

use crate::btree::cursor::Cursor;
use crate::btree::node::Node;
use crate::btree::split::{DEFAULT_FILL_PERCENT, clamp_fill_percent};
use crate::btree::{BTree, PageProvider, TreeNodes};
use crate::directory::{BucketHeader, Directory, validate_name};
use crate::error::{Error, PageId, Result};
use crate::page::{
    LEAF_ELEMENT_SIZE, BRANCH_ELEMENT_SIZE, LeafFlags, MAX_KEY_SIZE, MAX_VALUE_SIZE,
    PAGE_HEADER_SIZE, Page,
};
use crate::transaction::{Pager, TxContext};

/// Index of an open bucket inside a transaction.
pub(crate) type BucketId = usize;

/// Write-side state of a bucket opened for mutation.
#[derive(Debug)]
pub(crate) struct BucketState {
    pub(crate) header: BucketHeader,
    /// Header differs from what the parent leaf stores.
    pub(crate) header_dirty: bool,
    pub(crate) tree: TreeNodes,
    pub(crate) children: BTreeMap<Vec<u8>, BucketId>,
    pub(crate) fill_percent: f64,
}

impl BucketState {
    fn new(header: BucketHeader) -> Self {
        Self {
            header,
            header_dirty: false,
            tree: TreeNodes::default(),
            children: BTreeMap::new(),
            fill_percent: DEFAULT_FILL_PERCENT,
        }
    }
}

/// Buckets directory plus the buckets a transaction has opened for writing.
#[derive(Debug, Default)]
pub(crate) struct Buckets {
    pub(crate) directory: Directory,
    pub(crate) directory_dirty: bool,
    pub(crate) top: BTreeMap<Vec<u8>, BucketId>,
    states: Vec<Option<BucketState>>,
}

impl Buckets {
    pub(crate) fn new(directory: Directory) -> Self {
        Self { directory, ..Self::default() }
    }

    pub(crate) fn get(&self, id: BucketId) -> Option<&BucketState> {
        self.states.get(id).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: BucketId) -> Result<&mut BucketState> {
        self.states.get_mut(id).and_then(Option::as_mut).ok_or(Error::BucketNotFound)
    }

    fn insert(&mut self, state: BucketState) -> BucketId {
        self.states.push(Some(state));
        self.states.len() - 1
    }

    /// Open child `name` of `parent`, or the open top-level bucket `name`.
    fn child(&self, parent: Option<BucketId>, name: &[u8]) -> Option<BucketId> {
        match parent {
            None => self.top.get(name).copied(),
            Some(parent) => self.get(parent).and_then(|state| state.children.get(name).copied()),
        }
    }

    /// Drops the state of `id` and every open bucket below it.
    fn remove(&mut self, id: BucketId) {
        let Some(state) = self.states.get_mut(id).and_then(Option::take) else {
            return;
        };
        for child in state.children.into_values() {
            self.remove(child);
        }
    }

    fn ids(&self) -> Vec<BucketId> {
        self.states.iter().enumerate().filter(|(_, state)| state.is_some()).map(|(id, _)| id).collect()
    }
}

/// What a key resolves to inside a bucket.
enum Slot {
    Missing,
    Value,
    Bucket(BucketHeader),
}

impl TxContext {
    fn state(&self, id: BucketId) -> Result<&BucketState> {
        self.buckets.get(id).ok_or(Error::BucketNotFound)
    }

    /// Branch path to the leaf holding `key` in bucket `id`, and what the key
    /// currently resolves to.
    fn locate(&self, id: BucketId, key: &[u8]) -> Result<(Vec<usize>, Slot)> {
        let state = self.state(id)?;
        let mut cursor = Cursor::new(&self.pager, &self.arena, Some(&state.tree), state.header.root);
        let slot = match cursor.seek_raw(key)? {
            Some((found, value, flags)) if found == key => {
                if flags.contains(LeafFlags::BUCKET) {
                    Slot::Bucket(BucketHeader::from_bytes(value)?)
                } else {
                    Slot::Value
                }
            }
            _ => Slot::Missing,
        };
        Ok((cursor.path(), slot))
    }

    /// Runs `f` over the mutable tree of bucket `id`.
    fn with_tree<R>(
        &mut self,
        id: BucketId,
        f: impl FnOnce(&mut BTree<'_, Pager>, PageId) -> Result<R>,
    ) -> Result<R> {
        let TxContext { pager, arena, buckets, stats, .. } = self;
        let state = buckets.get_mut(id)?;
        let root = state.header.root;
        let mut tree = BTree::new(arena, &mut state.tree, pager, stats);
        f(&mut tree, root)
    }

    fn put_entry(&mut self, id: BucketId, path: &[usize], key: &[u8], value: &[u8], flags: LeafFlags) -> Result<()> {
        self.with_tree(id, |tree, root| {
            let leaf = tree.leaf_for_path(root, path)?;
            tree.put(leaf, key, value, flags);
            Ok(())
        })
    }

    /// Allocates an empty leaf page to root a new bucket.
    fn new_root(&mut self) -> Result<PageId> {
        let pgid = self.pager.allocate(1)?;
        let leaf = Node { is_leaf: true, ..Node::default() };
        leaf.write(self.pager.page_mut(pgid)?);
        Ok(pgid)
    }

    /// Opens bucket `name` under `parent` (top level for `None`) for
    /// writing. Returns `None` when no such bucket exists.
    pub(crate) fn open_bucket(&mut self, parent: Option<BucketId>, name: &[u8]) -> Result<Option<BucketId>> {
        if let Some(id) = self.buckets.child(parent, name) {
            return Ok(Some(id));
        }

        let header = match parent {
            None => match self.buckets.directory.get(name) {
                Some(header) => *header,
                None => return Ok(None),
            },
            Some(parent) => match self.locate(parent, name)?.1 {
                Slot::Bucket(header) => header,
                Slot::Missing | Slot::Value => return Ok(None),
            },
        };
        Ok(Some(self.attach(parent, name, BucketState::new(header))?))
    }

    fn attach(&mut self, parent: Option<BucketId>, name: &[u8], state: BucketState) -> Result<BucketId> {
        let id = self.buckets.insert(state);
        match parent {
            None => {
                self.buckets.top.insert(name.to_vec(), id);
            }
            Some(parent) => {
                self.buckets.get_mut(parent)?.children.insert(name.to_vec(), id);
            }
        }
        Ok(id)
    }

    /// Creates bucket `name` under `parent`.
    pub(crate) fn create_bucket(&mut self, parent: Option<BucketId>, name: &[u8]) -> Result<BucketId> {
        validate_name(name)?;
        let path = match parent {
            None => {
                if self.buckets.directory.get(name).is_some() {
                    return Err(Error::BucketExists);
                }
                Vec::new()
            }
            Some(parent) => match self.locate(parent, name)? {
                (_, Slot::Bucket(_)) => return Err(Error::BucketExists),
                (_, Slot::Value) => return Err(Error::IncompatibleValue),
                (path, Slot::Missing) => path,
            },
        };

        let header = BucketHeader::new(self.new_root()?);
        match parent {
            None => {
                self.buckets.directory.put(name, header);
                self.buckets.directory_dirty = true;
            }
            Some(parent) => self.put_entry(parent, &path, name, &header.to_bytes(), LeafFlags::BUCKET)?,
        }
        self.attach(parent, name, BucketState::new(header))
    }

    /// Creates bucket `name` under `parent` unless it already exists.
    pub(crate) fn create_bucket_if_not_exists(
        &mut self,
        parent: Option<BucketId>,
        name: &[u8],
    ) -> Result<BucketId> {
        validate_name(name)?;
        match self.open_bucket(parent, name)? {
            Some(id) => Ok(id),
            None => self.create_bucket(parent, name),
        }
    }

    /// Deletes bucket `name` under `parent` and frees every page it and its
    /// nested buckets own.
    pub(crate) fn delete_bucket(&mut self, parent: Option<BucketId>, name: &[u8]) -> Result<()> {
        let open = self.buckets.child(parent, name);
        match parent {
            None => {
                let header = *self.buckets.directory.get(name).ok_or(Error::BucketNotFound)?;
                self.free_bucket(open, header.root)?;
                self.buckets.directory.delete(name);
                self.buckets.directory_dirty = true;
                self.buckets.top.remove(name);
            }
            Some(parent) => {
                let (path, header) = match self.locate(parent, name)? {
                    (_, Slot::Missing) => return Err(Error::BucketNotFound),
                    (_, Slot::Value) => return Err(Error::IncompatibleValue),
                    (path, Slot::Bucket(header)) => (path, header),
                };
                self.free_bucket(open, header.root)?;
                self.with_tree(parent, |tree, root| {
                    let leaf = tree.leaf_for_path(root, &path)?;
                    tree.del(leaf, name);
                    Ok(())
                })?;
                self.buckets.get_mut(parent)?.children.remove(name);
            }
        }
        if let Some(id) = open {
            self.buckets.remove(id);
        }
        Ok(())
    }

    fn free_bucket(&mut self, open: Option<BucketId>, root: PageId) -> Result<()> {
        let nested = match open {
            Some(id) => self.with_tree(id, |tree, _| tree.free_tree(root))?,
            None => {
                let TxContext { pager, arena, stats, .. } = self;
                let mut nodes = TreeNodes::default();
                BTree::new(arena, &mut nodes, pager, stats).free_tree(root)?
            }
        };
        for (name, value) in nested {
            let header = BucketHeader::from_bytes(&value)?;
            let child = open.and_then(|id| self.buckets.child(Some(id), &name));
            self.free_bucket(child, header.root)?;
        }
        Ok(())
    }

    /// Rebalances the materialised nodes of every open bucket.
    pub(crate) fn rebalance_buckets(&mut self) -> Result<()> {
        for id in self.buckets.ids() {
            self.with_tree(id, |tree, _| tree.rebalance_all())?;
        }
        Ok(())
    }

    /// Spills every open bucket, nested buckets before their parents, and
    /// records the new roots in the parent leaves and the directory.
    pub(crate) fn spill_buckets(&mut self) -> Result<()> {
        let top: Vec<(Vec<u8>, BucketId)> =
            self.buckets.top.iter().map(|(name, &id)| (name.clone(), id)).collect();
        for (name, id) in top {
            self.spill_bucket(id)?;
            let state = self.buckets.get_mut(id)?;
            if state.header_dirty {
                state.header_dirty = false;
                let header = state.header;
                self.buckets.directory.put(&name, header);
                self.buckets.directory_dirty = true;
            }
        }
        Ok(())
    }

    fn spill_bucket(&mut self, id: BucketId) -> Result<()> {
        let children: Vec<(Vec<u8>, BucketId)> =
            self.state(id)?.children.iter().map(|(name, &child)| (name.clone(), child)).collect();
        for (name, child) in children {
            self.spill_bucket(child)?;
            let state = self.buckets.get_mut(child)?;
            if !state.header_dirty {
                continue;
            }
            state.header_dirty = false;
            let header = state.header;
            let path = match self.locate(id, &name)? {
                (path, Slot::Bucket(_)) => path,
                _ => {
                    return Err(Error::Corrupted {
                        reason: format!("nested bucket {} vanished from its parent", String::from_utf8_lossy(&name)),
                    });
                }
            };
            self.put_entry(id, &path, &name, &header.to_bytes(), LeafFlags::BUCKET)?;
        }

        let fill_percent = self.state(id)?.fill_percent;
        if let Some(root) = self.with_tree(id, |tree, _| tree.spill(fill_percent))? {
            let state = self.buckets.get_mut(id)?;
            if state.header.root != root {
                state.header.root = root;
                state.header_dirty = true;
            }
        }
        Ok(())
    }
}

/// Read handle to a bucket.
///
/// Keys and values it returns borrow the transaction and stay valid until
/// the transaction ends. Copy them to keep them longer.
#[derive(Clone, Copy)]
pub struct Bucket<'tx> {
    ctx: &'tx TxContext,
    state: Option<BucketId>,
    header: BucketHeader,
    fill_percent: f64,
}

impl<'tx> Bucket<'tx> {
    /// Top-level bucket `name`.
    pub(crate) fn top(ctx: &'tx TxContext, name: &[u8]) -> Option<Self> {
        if let Some(&id) = ctx.buckets.top.get(name) {
            return Self::open(ctx, id);
        }
        ctx.buckets.directory.get(name).map(|header| Self::closed(ctx, *header))
    }

    fn open(ctx: &'tx TxContext, id: BucketId) -> Option<Self> {
        ctx.buckets.get(id).map(|state| Self {
            ctx,
            state: Some(id),
            header: state.header,
            fill_percent: state.fill_percent,
        })
    }

    fn closed(ctx: &'tx TxContext, header: BucketHeader) -> Self {
        Self { ctx, state: None, header, fill_percent: DEFAULT_FILL_PERCENT }
    }

    fn tree(&self) -> Option<&'tx TreeNodes> {
        let ctx: &'tx TxContext = self.ctx;
        self.state.and_then(|id| ctx.buckets.get(id)).map(|state| &state.tree)
    }

    /// Root page of the bucket's tree as of its last commit.
    pub fn root(&self) -> PageId {
        self.header.root
    }

    /// Last value handed out by [`BucketMut::next_sequence`].
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Fill percent used when this bucket's nodes are split.
    pub fn fill_percent(&self) -> f64 {
        self.fill_percent
    }

    /// Whether the owning transaction is writable.
    pub fn writable(&self) -> bool {
        self.ctx.writable
    }

    /// Opens a cursor over the bucket.
    pub fn cursor(&self) -> Cursor<'tx> {
        let ctx: &'tx TxContext = self.ctx;
        ctx.cursors.set(ctx.cursors.get() + 1);
        Cursor::new(&ctx.pager, &ctx.arena, self.tree(), self.header.root)
    }

    /// Value stored under `key`. Keys naming a nested bucket read as absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn get(&self, key: &[u8]) -> Result<Option<&'tx [u8]>> {
        self.cursor().get(key)
    }

    /// Nested bucket `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'tx>>> {
        let ctx: &'tx TxContext = self.ctx;
        if let Some(id) = self.state.and_then(|id| ctx.buckets.child(Some(id), name)) {
            return Ok(Self::open(ctx, id));
        }
        match self.cursor().seek_raw(name)? {
            Some((key, value, flags)) if key == name && flags.contains(LeafFlags::BUCKET) => {
                Ok(Some(Self::closed(ctx, BucketHeader::from_bytes(value)?)))
            }
            _ => Ok(None),
        }
    }

    /// Calls `f` for every entry in key order. Nested buckets are passed with
    /// a `None` value. The first error returned by `f` stops the iteration and
    /// is returned as is.
    ///
    /// # Errors
    ///
    /// Returns the callback's error, or [`Error::Corrupted`] converted into `E`.
    pub fn for_each<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&'tx [u8], Option<&'tx [u8]>) -> Result<(), E>,
        E: From<Error>,
    {
        let mut cursor = self.cursor();
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            f(key, value)?;
            item = cursor.next()?;
        }
        Ok(())
    }

    /// Page and key statistics for this bucket and every bucket nested in it,
    /// as of the pages last written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page is malformed.
    pub fn stats(&self) -> Result<BucketStats> {
        bucket_stats(&self.ctx.pager, self.header.root)
    }
}

impl std::fmt::Debug for Bucket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("root", &self.header.root)
            .field("sequence", &self.header.sequence)
            .finish_non_exhaustive()
    }
}

/// Write handle to a bucket.
pub struct BucketMut<'tx> {
    ctx: &'tx mut TxContext,
    id: BucketId,
}

impl<'tx> BucketMut<'tx> {
    pub(crate) fn new(ctx: &'tx mut TxContext, id: BucketId) -> Self {
        Self { ctx, id }
    }

    /// Read view of this bucket.
    pub fn as_bucket(&self) -> Bucket<'_> {
        let ctx: &TxContext = self.ctx;
        Bucket::open(ctx, self.id).unwrap_or_else(|| Bucket::closed(ctx, BucketHeader::default()))
    }

    /// See [`Bucket::get`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        self.as_bucket().get(key)
    }

    /// See [`Bucket::cursor`].
    pub fn cursor(&self) -> Cursor<'_> {
        self.as_bucket().cursor()
    }

    /// Nested bucket `name`, read-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        self.as_bucket().bucket(name)
    }

    /// Current sequence value.
    pub fn sequence(&self) -> u64 {
        self.as_bucket().sequence()
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// - [`Error::KeyRequired`] for an empty key.
    /// - [`Error::KeyTooLarge`] / [`Error::ValueTooLarge`] past the size limits.
    /// - [`Error::IncompatibleValue`] if `key` names a nested bucket.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge { len: key.len(), max: MAX_KEY_SIZE });
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge { len: value.len(), max: MAX_VALUE_SIZE });
        }

        let (path, slot) = self.ctx.locate(self.id, key)?;
        if let Slot::Bucket(_) = slot {
            return Err(Error::IncompatibleValue);
        }
        self.ctx.put_entry(self.id, &path, key, value, LeafFlags::empty())
    }

    /// Removes `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleValue`] if `key` names a nested bucket.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let (path, slot) = self.ctx.locate(self.id, key)?;
        match slot {
            Slot::Missing => Ok(false),
            Slot::Bucket(_) => Err(Error::IncompatibleValue),
            Slot::Value => self.ctx.with_tree(self.id, |tree, root| {
                let leaf = tree.leaf_for_path(root, &path)?;
                Ok(tree.del(leaf, key))
            }),
        }
    }

    /// Increments and returns the bucket's sequence counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BucketNotFound`] if the bucket was deleted.
    pub fn next_sequence(&mut self) -> Result<u64> {
        let state = self.ctx.buckets.get_mut(self.id)?;
        state.header.sequence += 1;
        state.header_dirty = true;
        Ok(state.header.sequence)
    }

    /// Sets the fill percent used when this bucket's nodes split. Values are
    /// clamped to `0.1..=1.0`; the setting lasts for this transaction.
    pub fn set_fill_percent(&mut self, fill_percent: f64) {
        if let Ok(state) = self.ctx.buckets.get_mut(self.id) {
            state.fill_percent = clamp_fill_percent(fill_percent);
        }
    }

    /// Creates nested bucket `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::BucketExists`] if it already exists.
    /// - [`Error::IncompatibleValue`] if `name` holds a plain value.
    /// - [`Error::BucketNameRequired`] / [`Error::BucketNameTooLarge`] for a bad name.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        let id = self.ctx.create_bucket(Some(self.id), name)?;
        Ok(BucketMut::new(self.ctx, id))
    }

    /// Creates nested bucket `name` unless it exists, and opens it.
    ///
    /// # Errors
    ///
    /// Same as [`BucketMut::create_bucket`], minus [`Error::BucketExists`].
    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        let id = self.ctx.create_bucket_if_not_exists(Some(self.id), name)?;
        Ok(BucketMut::new(self.ctx, id))
    }

    /// Opens nested bucket `name` for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page on the way is malformed.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<Option<BucketMut<'_>>> {
        let id = self.ctx.open_bucket(Some(self.id), name)?;
        Ok(id.map(|id| BucketMut::new(self.ctx, id)))
    }

    /// Deletes nested bucket `name` and everything in it.
    ///
    /// # Errors
    ///
    /// - [`Error::BucketNotFound`] if it does not exist.
    /// - [`Error::IncompatibleValue`] if `name` holds a plain value.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.ctx.delete_bucket(Some(self.id), name)
    }

    /// See [`Bucket::for_each`].
    ///
    /// # Errors
    ///
    /// Returns the callback's error, or [`Error::Corrupted`] converted into `E`.
    pub fn for_each<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<(), E>,
        E: From<Error>,
    {
        self.as_bucket().for_each(f)
    }

    /// See [`Bucket::stats`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a page is malformed.
    pub fn stats(&self) -> Result<BucketStats> {
        self.as_bucket().stats()
    }
}

impl std::fmt::Debug for BucketMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketMut").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Page and key statistics of a bucket, including its nested buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// Branch pages.
    pub branch_page_n: usize,
    /// Overflow pages owned by branch pages.
    pub branch_overflow_n: usize,
    /// Leaf pages.
    pub leaf_page_n: usize,
    /// Overflow pages owned by leaf pages.
    pub leaf_overflow_n: usize,
    /// Leaf entries, nested bucket entries included.
    pub key_n: usize,
    /// Tree depth; 1 for a single leaf.
    pub depth: usize,
    /// Bytes allocated to branch pages.
    pub branch_alloc: usize,
    /// Bytes in use on branch pages.
    pub branch_in_use: usize,
    /// Bytes allocated to leaf pages.
    pub leaf_alloc: usize,
    /// Bytes in use on leaf pages.
    pub leaf_in_use: usize,
    /// Buckets counted, this one included.
    pub bucket_n: usize,
}

impl BucketStats {
    /// Accumulates `other`. Depth takes the maximum.
    pub fn add(&mut self, other: &BucketStats) {
        self.branch_page_n += other.branch_page_n;
        self.branch_overflow_n += other.branch_overflow_n;
        self.leaf_page_n += other.leaf_page_n;
        self.leaf_overflow_n += other.leaf_overflow_n;
        self.key_n += other.key_n;
        self.depth = self.depth.max(other.depth);
        self.branch_alloc += other.branch_alloc;
        self.branch_in_use += other.branch_in_use;
        self.leaf_alloc += other.leaf_alloc;
        self.leaf_in_use += other.leaf_in_use;
        self.bucket_n += other.bucket_n;
    }
}

fn bucket_stats(pager: &Pager, root: PageId) -> Result<BucketStats> {
    let mut stats = BucketStats { bucket_n: 1, ..BucketStats::default() };
    let mut nested = Vec::new();
    collect_stats(pager, root, 0, &mut stats, &mut nested)?;

    let page_size = pager.page_size();
    stats.branch_alloc = (stats.branch_page_n + stats.branch_overflow_n) * page_size;
    stats.leaf_alloc = (stats.leaf_page_n + stats.leaf_overflow_n) * page_size;
    for child in nested {
        stats.add(&bucket_stats(pager, child)?);
    }
    Ok(stats)
}

fn collect_stats(
    pager: &Pager,
    pgid: PageId,
    depth: usize,
    stats: &mut BucketStats,
    nested: &mut Vec<PageId>,
) -> Result<()> {
    let page = pager.page(pgid)?;
    if !page.elements_in_bounds() {
        return Err(Error::Corrupted { reason: format!("page {pgid} has elements outside its bounds") });
    }
    stats.depth = stats.depth.max(depth + 1);
    let count = page.count() as usize;
    if page.is_leaf() {
        stats.leaf_page_n += 1;
        stats.leaf_overflow_n += page.overflow() as usize;
        stats.key_n += count;
        stats.leaf_in_use += used_bytes(&page, LEAF_ELEMENT_SIZE);
        for i in 0..count {
            let elem = page.leaf_element(i);
            if elem.is_bucket() {
                nested.push(BucketHeader::from_bytes(elem.value)?.root);
            }
        }
    } else if page.is_branch() {
        stats.branch_page_n += 1;
        stats.branch_overflow_n += page.overflow() as usize;
        stats.branch_in_use += used_bytes(&page, BRANCH_ELEMENT_SIZE);
        for i in 0..count {
            collect_stats(pager, page.branch_element(i).pgid, depth + 1, stats, nested)?;
        }
    } else {
        return Err(Error::Corrupted {
            reason: format!("page {pgid} is a {} page inside a bucket", page.flags().kind()),
        });
    }
    Ok(())
}

fn used_bytes(page: &Page<'_>, element_size: usize) -> usize {
    let count = page.count() as usize;
    let data: usize = (0..count)
        .map(|i| {
            if page.is_leaf() {
                let elem = page.leaf_element(i);
                elem.key.len() + elem.value.len()
            } else {
                page.branch_element(i).key.len()
            }
        })
        .sum();
    PAGE_HEADER_SIZE + count * element_size + data
}
