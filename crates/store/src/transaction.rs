//! Read and write transactions.
//!
//! A transaction pins the memory map and the meta record current when it
//! began. Readers never block and never see later commits. The single writer
//! works on a private copy of the freelist and keeps every page it writes in
//! memory until commit:
//!
//! ```text
//! rebalance ─► spill ─► directory ─► freelist ─► grow ─► pages ─► sync ─► meta ─► sync
//! ```
//!
//! Dropping a writer without committing discards all of it.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::btree::PageProvider;
use crate::btree::node::NodeArena;
use crate::bucket::{Bucket, BucketMut, Buckets};
use crate::db::Database;
use crate::directory::Directory;
use crate::error::{Error, PageId, Result, TxId};
use crate::freelist::Freelist;
use crate::integrity::{self, CheckReport};
use crate::page::{Meta, Page, PageFlags, PageHeader, PageMut, pages_for};

/// Page access for one transaction: the pinned map plus the writer's dirty pages.
pub(crate) struct Pager {
    pub(crate) map: Arc<Mmap>,
    pub(crate) page_size: usize,
    pub(crate) meta: Meta,
    pub(crate) freelist: Freelist,
    /// Pages allocated by this transaction, keyed by id, each buffer covering
    /// the page and its overflow run.
    pub(crate) dirty: BTreeMap<PageId, Vec<u8>>,
    page_count: usize,
    page_alloc: usize,
}

impl Pager {
    pub(crate) fn new(map: Arc<Mmap>, page_size: usize, meta: Meta, freelist: Freelist) -> Self {
        Self { map, page_size, meta, freelist, dirty: BTreeMap::new(), page_count: 0, page_alloc: 0 }
    }

    /// Buffer of a page this transaction allocated.
    fn dirty_page(&mut self, id: PageId) -> Result<PageMut<'_>> {
        self.page_mut(id).map(PageMut::new)
    }

    fn write_directory(&mut self, directory: &Directory) -> Result<()> {
        self.free(self.meta.buckets)?;
        let id = self.allocate(pages_for(directory.size(), self.page_size))?;
        directory.write(&mut self.dirty_page(id)?);
        self.meta.buckets = id;
        Ok(())
    }

    fn write_freelist(&mut self) -> Result<()> {
        // The old page goes to pending before the new size is taken.
        self.free(self.meta.freelist)?;
        let id = self.allocate(pages_for(self.freelist.size(), self.page_size))?;
        let Pager { dirty, freelist, .. } = self;
        let buf = dirty.get_mut(&id).ok_or_else(|| Error::Corrupted {
            reason: format!("freelist page {id} was not allocated"),
        })?;
        freelist.write(&mut PageMut::new(buf));
        self.meta.freelist = id;
        Ok(())
    }
}

impl PageProvider for Pager {
    fn page(&self, id: PageId) -> Result<Page<'_>> {
        if let Some(buf) = self.dirty.get(&id) {
            return Page::from_bytes(buf);
        }
        if id > self.meta.pgid_hi {
            return Err(Error::Corrupted {
                reason: format!("page {id} is past the high water mark {}", self.meta.pgid_hi),
            });
        }
        Page::in_map(&self.map, id, self.page_size)
    }

    fn mapped(&self) -> Option<&Arc<Mmap>> {
        Some(&self.map)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&mut self, count: usize) -> Result<PageId> {
        let count = count.max(1);
        let mut id = self.freelist.allocate(count);
        if id == 0 {
            id = self.meta.pgid_hi + 1;
            self.meta.pgid_hi += count as PageId;
        }

        let mut buf = vec![0u8; count * self.page_size];
        PageMut::new(&mut buf).set_header(&PageHeader {
            id,
            flags: PageFlags::empty(),
            count: 0,
            overflow: (count - 1) as u32,
        });
        self.dirty.insert(id, buf);
        self.page_count += count;
        self.page_alloc += count * self.page_size;
        Ok(id)
    }

    fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        self.dirty
            .get_mut(&id)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| Error::Corrupted { reason: format!("page {id} is not writable in this transaction") })
    }

    fn free(&mut self, id: PageId) -> Result<()> {
        if let Some(buf) = self.dirty.remove(&id) {
            let overflow = Page::from_bytes(&buf)?.overflow();
            return self.freelist.reclaim(id, overflow);
        }
        let overflow = self.page(id)?.overflow();
        self.freelist.free(self.meta.txid, id, overflow)
    }
}

/// State shared by a transaction and the bucket handles borrowing it.
pub(crate) struct TxContext {
    pub(crate) writable: bool,
    pub(crate) pager: Pager,
    pub(crate) arena: NodeArena,
    pub(crate) buckets: Buckets,
    pub(crate) stats: TxStats,
    pub(crate) cursors: Cell<usize>,
    /// Meta record as of begin.
    pub(crate) begin_meta: Meta,
}

impl TxContext {
    pub(crate) fn new(writable: bool, pager: Pager, directory: Directory) -> Self {
        let begin_meta = pager.meta;
        Self {
            writable,
            pager,
            arena: NodeArena::default(),
            buckets: Buckets::new(directory),
            stats: TxStats::default(),
            cursors: Cell::new(0),
            begin_meta,
        }
    }
}

/// Counters and timings collected by a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    /// Pages allocated.
    pub page_count: usize,
    /// Bytes allocated.
    pub page_alloc: usize,
    /// Cursors created.
    pub cursor_count: usize,
    /// Nodes materialised.
    pub node_count: usize,
    /// Node keys and values copied off the map.
    pub node_deref: usize,
    /// Rebalance passes.
    pub rebalance: usize,
    /// Time spent rebalancing.
    pub rebalance_time: Duration,
    /// Node splits.
    pub split: usize,
    /// Nodes written to pages.
    pub spill: usize,
    /// Time spent spilling.
    pub spill_time: Duration,
    /// Page writes to the file.
    pub write: usize,
    /// Time spent writing and syncing.
    pub write_time: Duration,
}

impl TxStats {
    /// Accumulates `other` into `self`.
    pub fn add(&mut self, other: &TxStats) {
        self.page_count += other.page_count;
        self.page_alloc += other.page_alloc;
        self.cursor_count += other.cursor_count;
        self.node_count += other.node_count;
        self.node_deref += other.node_deref;
        self.rebalance += other.rebalance;
        self.rebalance_time += other.rebalance_time;
        self.split += other.split;
        self.spill += other.spill;
        self.spill_time += other.spill_time;
        self.write += other.write;
        self.write_time += other.write_time;
    }
}

/// A read-only or read-write transaction.
///
/// Read transactions end when dropped. Write transactions end with
/// [`Transaction::commit`] or [`Transaction::rollback`]; dropping one rolls
/// it back.
pub struct Transaction<'db> {
    db: &'db Database,
    ctx: TxContext,
    /// Held for the whole life of a write transaction.
    writer: Option<MutexGuard<'db, ()>>,
    closed: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, ctx: TxContext, writer: Option<MutexGuard<'db, ()>>) -> Self {
        Self { db, ctx, writer, closed: false }
    }

    /// Transaction id: the id this transaction will commit as for writers,
    /// the id of the visible commit for readers.
    pub fn id(&self) -> TxId {
        self.ctx.pager.meta.txid
    }

    /// Whether this transaction can modify the database.
    pub fn writable(&self) -> bool {
        self.ctx.writable
    }

    /// Size in bytes of the database as seen by this transaction.
    pub fn size(&self) -> u64 {
        (self.ctx.pager.meta.pgid_hi + 1) * self.ctx.pager.page_size as u64
    }

    /// Top-level bucket `name`.
    pub fn bucket(&self, name: &[u8]) -> Option<Bucket<'_>> {
        Bucket::top(&self.ctx, name)
    }

    /// Top-level bucket `name`, opened for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TxNotWritable`] on a read transaction.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<Option<BucketMut<'_>>> {
        self.ensure_writable()?;
        let id = self.ctx.open_bucket(None, name)?;
        Ok(id.map(|id| BucketMut::new(&mut self.ctx, id)))
    }

    /// Names of the top-level buckets, in order.
    pub fn buckets(&self) -> impl Iterator<Item = &[u8]> {
        self.ctx.buckets.directory.iter().map(|(name, _)| name)
    }

    /// Calls `f` for every top-level bucket in name order. The first error
    /// returned by `f` stops the iteration and is returned as is.
    ///
    /// # Errors
    ///
    /// Returns the callback's error.
    pub fn for_each<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[u8], Bucket<'_>) -> Result<(), E>,
        E: From<Error>,
    {
        for (name, _) in self.ctx.buckets.directory.iter() {
            let bucket = Bucket::top(&self.ctx, name).ok_or(Error::BucketNotFound)?;
            f(name, bucket)?;
        }
        Ok(())
    }

    /// Creates top-level bucket `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::TxNotWritable`] on a read transaction.
    /// - [`Error::BucketExists`] if it already exists.
    /// - [`Error::BucketNameRequired`] / [`Error::BucketNameTooLarge`] for a bad name.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        self.ensure_writable()?;
        let id = self.ctx.create_bucket(None, name)?;
        Ok(BucketMut::new(&mut self.ctx, id))
    }

    /// Creates top-level bucket `name` unless it exists, and opens it.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::create_bucket`], minus [`Error::BucketExists`].
    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_>> {
        self.ensure_writable()?;
        let id = self.ctx.create_bucket_if_not_exists(None, name)?;
        Ok(BucketMut::new(&mut self.ctx, id))
    }

    /// Deletes top-level bucket `name` and everything in it.
    ///
    /// # Errors
    ///
    /// - [`Error::TxNotWritable`] on a read transaction.
    /// - [`Error::BucketNotFound`] if it does not exist.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.ctx.delete_bucket(None, name)
    }

    /// Counters collected so far.
    pub fn stats(&self) -> TxStats {
        let mut stats = self.ctx.stats;
        stats.page_count += self.ctx.pager.page_count;
        stats.page_alloc += self.ctx.pager.page_alloc;
        stats.cursor_count += self.ctx.cursors.get();
        stats
    }

    /// Verifies the structure of the database as of this transaction's start.
    ///
    /// # Errors
    ///
    /// Returns an error only when the check cannot run at all; problems found
    /// are listed in the report.
    pub fn check(&self) -> Result<CheckReport> {
        integrity::check(&self.ctx)
    }

    /// Writes every change to disk and publishes it to later transactions.
    ///
    /// # Errors
    ///
    /// - [`Error::TxNotWritable`] on a read transaction.
    /// - [`Error::Io`] if a write or sync fails; nothing is published then.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_writable()?;
        let started = Instant::now();
        let db = self.db;
        let page_size = self.ctx.pager.page_size;

        let start = Instant::now();
        self.ctx.rebalance_buckets()?;
        self.ctx.stats.rebalance_time += start.elapsed();

        let start = Instant::now();
        self.ctx.spill_buckets()?;
        self.ctx.stats.spill_time += start.elapsed();

        let ctx = &mut self.ctx;
        if ctx.buckets.directory_dirty {
            ctx.pager.write_directory(&ctx.buckets.directory)?;
        }
        ctx.pager.write_freelist()?;

        let size = (ctx.pager.meta.pgid_hi + 1) * page_size as u64;
        if let Some(map) = db.grow(size)? {
            ctx.pager.map = map;
            ctx.stats.node_deref += ctx.arena.dereference();
        }

        let start = Instant::now();
        for (&id, buf) in &ctx.pager.dirty {
            db.file().write_at(buf, id * page_size as u64)?;
            ctx.stats.write += 1;
        }
        let sync = !db.options().no_sync;
        if sync {
            db.file().sync()?;
        }

        let mut meta_page = vec![0u8; page_size];
        ctx.pager.meta.write_page(&mut meta_page);
        db.file().write_meta(&meta_page, ctx.pager.meta.slot() * page_size as u64, sync)?;
        ctx.stats.write += 1;
        ctx.stats.write_time += start.elapsed();

        let meta = ctx.pager.meta;
        let pages = ctx.pager.dirty.len();
        let freelist = std::mem::take(&mut ctx.pager.freelist);
        let stats = self.stats();
        db.publish(meta, freelist, &stats);
        self.closed = true;

        debug!(
            txid = meta.txid,
            pages,
            pgid_hi = meta.pgid_hi,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Committed transaction"
        );
        Ok(())
    }

    /// Discards the transaction.
    pub fn rollback(self) {
        drop(self);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.ctx.writable { Ok(()) } else { Err(Error::TxNotWritable) }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.writer.is_some() {
            debug!(txid = self.id(), dirty = self.ctx.pager.dirty.len(), "Rolled back transaction");
            if std::thread::panicking() {
                warn!(txid = self.id(), "Write transaction dropped during a panic");
            }
        } else {
            let stats = self.stats();
            self.db.end_read(self.ctx.begin_meta.txid, &stats);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("writable", &self.ctx.writable)
            .finish_non_exhaustive()
    }
}
