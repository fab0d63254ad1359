//! Database handle: file, memory map, meta state and transaction admission.
//!
//! # Example
//!
//! ```no_run
//! use inkvault_store::Database;
//!
//! let db = Database::open("data.ink")?;
//!
//! db.update(|tx| {
//!     let mut widgets = tx.create_bucket_if_not_exists(b"widgets")?;
//!     widgets.put(b"foo", b"bar")?;
//!     Ok::<_, inkvault_store::Error>(())
//! })?;
//!
//! db.view(|tx| {
//!     let widgets = tx.bucket(b"widgets").ok_or(inkvault_store::Error::BucketNotFound)?;
//!     assert_eq!(widgets.get(b"foo")?, Some(&b"bar"[..]));
//!     Ok::<_, inkvault_store::Error>(())
//! })?;
//! # Ok::<(), inkvault_store::Error>(())
//! ```

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use memmap2::Mmap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{DataFile, mmap_size};
use crate::directory::Directory;
use crate::error::{Error, PageId, Result, TxId};
use crate::freelist::Freelist;
use crate::integrity::CheckReport;
use crate::page::{
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, META_SIZE, MIN_PAGE_SIZE, Meta, PAGE_HEADER_SIZE, Page,
    PageFlags, PageHeader, PageMut,
};
use crate::tracker::ReaderTracker;
use crate::transaction::{Pager, Transaction, TxContext, TxStats};

/// Permission bits for newly created data files.
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Page ids of a freshly initialised file.
const INIT_FREELIST_PAGE: PageId = 2;
const INIT_BUCKETS_PAGE: PageId = 3;

/// Options for [`Database::open_with_options`].
#[derive(Debug, Clone, bon::Builder)]
pub struct DatabaseOptions {
    /// Open with a shared lock and reject write transactions.
    #[builder(default)]
    pub read_only: bool,
    /// Minimum size of the initial memory map, in bytes.
    #[builder(default)]
    pub initial_mmap_size: u64,
    /// Skip fsync on commit. Unsafe against power loss; for tests and bulk loads.
    #[builder(default)]
    pub no_sync: bool,
    /// Skip the metadata fsync after growing the file.
    #[builder(default)]
    pub no_grow_sync: bool,
    /// Page size for new files (power of two, 1 KiB to 64 KiB). Existing
    /// files keep the page size they were created with.
    #[builder(default = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
    /// Unix permission bits used when creating the file.
    #[builder(default = DEFAULT_FILE_MODE)]
    pub file_mode: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            initial_mmap_size: 0,
            no_sync: false,
            no_grow_sync: false,
            page_size: DEFAULT_PAGE_SIZE,
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

/// Database-wide statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseStats {
    /// Page size in bytes.
    pub page_size: usize,
    /// Pages free for reuse.
    pub free_page_n: usize,
    /// Pages freed but still visible to an open reader.
    pub pending_page_n: usize,
    /// Bytes held by free pages.
    pub free_alloc: usize,
    /// Bytes the freelist page needs.
    pub freelist_inuse: usize,
    /// Read transactions started.
    pub tx_n: u64,
    /// Read transactions currently open.
    pub open_tx_n: usize,
    /// Counters accumulated from finished transactions.
    pub tx_stats: TxStats,
}

/// Mutable state shared by all transactions, guarded by one short-held lock.
#[derive(Debug)]
struct DbState {
    meta: Meta,
    freelist: Freelist,
    readers: ReaderTracker,
    open: bool,
    tx_n: u64,
    tx_stats: TxStats,
}

/// An open database file.
///
/// Any number of read transactions may run alongside one write transaction.
/// Readers see the state committed when they began and are never blocked by
/// the writer.
pub struct Database {
    file: DataFile,
    options: DatabaseOptions,
    page_size: usize,
    /// Current map. Transactions hold their own reference, so a remap never
    /// invalidates pages they are reading.
    map: ArcSwap<Mmap>,
    state: Mutex<DbState>,
    writer: Mutex<()>,
}

impl Database {
    /// Opens or creates the database at `path` with default options.
    ///
    /// # Errors
    ///
    /// See [`Database::open_with_options`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, DatabaseOptions::default())
    }

    /// Opens or creates the database at `path`.
    ///
    /// A new file gets two meta pages, an empty freelist and an empty
    /// buckets directory. For an existing file the valid meta page with the
    /// larger transaction id wins.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPageSize`] if `options.page_size` is out of range.
    /// - [`Error::DatabaseAlreadyOpen`] if another handle holds a conflicting lock.
    /// - [`Error::InvalidFile`] / [`Error::VersionMismatch`] for a foreign file.
    /// - [`Error::Corrupted`] if neither meta page is valid.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: DatabaseOptions) -> Result<Self> {
        let path = path.as_ref();
        validate_page_size(options.page_size)?;
        let file = DataFile::open(path, options.read_only, options.file_mode)?;

        if file.len()? == 0 {
            if options.read_only {
                return Err(Error::InvalidFile);
            }
            initialize(&file, options.page_size, !options.no_sync)?;
            info!(path = %path.display(), page_size = options.page_size, "Initialised new database");
        }

        let (meta, page_size) = load_meta(&file)?;
        if !options.read_only {
            let size = mmap_size(file.len()?.max(options.initial_mmap_size), page_size)?;
            file.grow(size, !options.no_grow_sync)?;
        }
        let map = file.map()?;

        let freelist = Freelist::read(meta_page(&map, &meta, meta.freelist, page_size)?)?;
        info!(
            path = %path.display(),
            txid = meta.txid,
            page_size,
            pgid_hi = meta.pgid_hi,
            free_pages = freelist.free_count(),
            read_only = options.read_only,
            "Opened database"
        );

        Ok(Self {
            file,
            options,
            page_size,
            map: ArcSwap::from_pointee(map),
            state: Mutex::new(DbState {
                meta,
                freelist,
                readers: ReaderTracker::default(),
                open: true,
                tx_n: 0,
                tx_stats: TxStats::default(),
            }),
            writer: Mutex::new(()),
        })
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the handle was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Begins a read transaction over the last committed state.
    ///
    /// # Errors
    ///
    /// - [`Error::DatabaseNotOpen`] after [`Database::close`].
    /// - [`Error::Corrupted`] if the buckets directory cannot be read.
    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::DatabaseNotOpen);
        }
        let meta = state.meta;
        let map = self.map.load_full();
        let directory = read_directory(&map, &meta, self.page_size)?;
        state.readers.register(meta.txid);
        state.tx_n += 1;
        drop(state);

        let pager = Pager::new(map, self.page_size, meta, Freelist::default());
        Ok(Transaction::new(self, TxContext::new(false, pager, directory), None))
    }

    /// Begins the write transaction, waiting for the current writer to finish.
    ///
    /// # Errors
    ///
    /// - [`Error::DatabaseReadOnly`] on a read-only handle.
    /// - [`Error::DatabaseNotOpen`] after [`Database::close`].
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        if self.options.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        let writer = self.writer.lock();
        self.start_write(writer)
    }

    /// Begins the write transaction unless another one is active.
    ///
    /// # Errors
    ///
    /// - [`Error::TxInProgress`] if a write transaction is active.
    /// - Otherwise as [`Database::begin_write`].
    pub fn try_begin_write(&self) -> Result<Transaction<'_>> {
        if self.options.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        let writer = self.writer.try_lock().ok_or(Error::TxInProgress)?;
        self.start_write(writer)
    }

    fn start_write<'db>(&'db self, writer: MutexGuard<'db, ()>) -> Result<Transaction<'db>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::DatabaseNotOpen);
        }
        self.release_pending(&mut state);

        let map = self.map.load_full();
        let directory = read_directory(&map, &state.meta, self.page_size)?;
        let mut meta = state.meta;
        meta.txid += 1;
        let freelist = state.freelist.clone();
        drop(state);

        let pager = Pager::new(map, self.page_size, meta, freelist);
        Ok(Transaction::new(self, TxContext::new(true, pager, directory), Some(writer)))
    }

    /// Runs `f` in a read transaction.
    ///
    /// # Errors
    ///
    /// Returns the callback's error verbatim, or a begin error converted into `E`.
    pub fn view<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<Error>,
    {
        let tx = self.begin_read()?;
        f(&tx)
    }

    /// Runs `f` in a write transaction and commits if it succeeds. An error
    /// or a panic in `f` rolls the transaction back and releases the writer.
    ///
    /// # Errors
    ///
    /// Returns the callback's error verbatim, or a begin/commit error
    /// converted into `E`.
    pub fn update<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<Error>,
    {
        let mut tx = self.begin_write()?;
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Closes the handle, waiting for the active writer to finish. Open read
    /// transactions keep working on their snapshot. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the advisory lock cannot be released.
    pub fn close(&self) -> Result<()> {
        let _writer = self.writer.lock();
        let mut state = self.state.lock();
        if !state.open {
            return Ok(());
        }
        state.open = false;
        let open_readers = state.readers.len();
        drop(state);

        self.file.unlock()?;
        info!(path = %self.path().display(), open_readers, "Closed database");
        Ok(())
    }

    /// Current statistics.
    pub fn stats(&self) -> DatabaseStats {
        let state = self.state.lock();
        let free_page_n = state.freelist.free_count();
        DatabaseStats {
            page_size: self.page_size,
            free_page_n,
            pending_page_n: state.freelist.pending_count(),
            free_alloc: free_page_n * self.page_size,
            freelist_inuse: state.freelist.size(),
            tx_n: state.tx_n,
            open_tx_n: state.readers.len(),
            tx_stats: state.tx_stats,
        }
    }

    /// Checks the last committed state. See [`Transaction::check`].
    ///
    /// # Errors
    ///
    /// Returns an error if no read transaction can be started.
    pub fn check(&self) -> Result<CheckReport> {
        self.begin_read()?.check()
    }

    /// Page ids free for reuse, descending.
    pub fn free_page_ids(&self) -> Vec<PageId> {
        self.state.lock().freelist.free_ids().to_vec()
    }

    /// Page ids waiting for readers to finish.
    pub fn pending_page_ids(&self) -> Vec<PageId> {
        self.state.lock().freelist.pending_ids()
    }

    pub(crate) fn file(&self) -> &DataFile {
        &self.file
    }

    pub(crate) fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Ensures the map covers `size` bytes, growing the file and remapping
    /// when it does not. Returns the new map if one was made.
    pub(crate) fn grow(&self, size: u64) -> Result<Option<Arc<Mmap>>> {
        let current = self.map.load().len() as u64;
        if current >= size {
            return Ok(None);
        }
        let new_size = mmap_size(size, self.page_size)?;
        self.file.grow(new_size, !self.options.no_grow_sync)?;
        let map = Arc::new(self.file.map()?);
        self.map.store(Arc::clone(&map));
        debug!(old_size = current, new_size, "Remapped data file");
        Ok(Some(map))
    }

    /// Makes a commit visible to new transactions.
    pub(crate) fn publish(&self, meta: Meta, freelist: Freelist, stats: &TxStats) {
        let mut state = self.state.lock();
        state.meta = meta;
        state.freelist = freelist;
        state.tx_stats.add(stats);
        self.release_pending(&mut state);
    }

    /// Retires a read transaction that began at `txid`.
    pub(crate) fn end_read(&self, txid: TxId, stats: &TxStats) {
        let mut state = self.state.lock();
        state.readers.unregister(txid);
        state.tx_stats.add(stats);
        self.release_pending(&mut state);
    }

    fn release_pending(&self, state: &mut DbState) {
        let threshold = state.readers.release_threshold(state.meta.txid);
        let released = state.freelist.release(threshold);
        if released > 0 {
            debug!(threshold, released, "Released pending pages");
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close database cleanly");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path())
            .field("page_size", &self.page_size)
            .field("read_only", &self.options.read_only)
            .finish_non_exhaustive()
    }
}

fn validate_page_size(size: usize) -> Result<()> {
    if size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(Error::InvalidPageSize { size })
    }
}

/// Writes both meta pages, an empty freelist and an empty buckets page.
fn initialize(file: &DataFile, page_size: usize, sync: bool) -> Result<()> {
    let mut buf = vec![0u8; page_size * 4];
    let (metas, rest) = buf.split_at_mut(page_size * 2);
    for (txid, page) in metas.chunks_exact_mut(page_size).enumerate() {
        let mut meta = Meta::new(
            page_size as u32,
            txid as TxId,
            INIT_FREELIST_PAGE,
            INIT_BUCKETS_PAGE,
            INIT_BUCKETS_PAGE,
        );
        meta.write_page(page);
    }
    let (freelist, buckets) = rest.split_at_mut(page_size);
    PageMut::new(freelist).set_header(&PageHeader::new(INIT_FREELIST_PAGE, PageFlags::FREELIST));
    PageMut::new(buckets).set_header(&PageHeader::new(INIT_BUCKETS_PAGE, PageFlags::BUCKETS));

    file.write_at(&buf, 0)?;
    if sync {
        file.sync()?;
    }
    Ok(())
}

/// Decodes and validates the meta record on page `page_id` at `offset`.
fn read_meta(file: &DataFile, offset: u64, page_id: PageId) -> Result<Meta> {
    let mut buf = [0u8; PAGE_HEADER_SIZE + META_SIZE];
    if file.len()? < offset + buf.len() as u64 {
        return Err(Error::InvalidFile);
    }
    file.read_at(&mut buf, offset)?;
    let meta = Meta::from_bytes(&buf[PAGE_HEADER_SIZE..])?;
    meta.validate(page_id)?;
    validate_page_size(meta.page_size as usize)
        .map_err(|_| Error::Corrupted { reason: format!("meta page {page_id} has page size {}", meta.page_size) })?;
    Ok(meta)
}

/// Picks the live meta record: the valid one with the larger transaction id.
fn load_meta(file: &DataFile) -> Result<(Meta, usize)> {
    let first = read_meta(file, 0, 0);

    // Meta page 1 sits one page in; without a valid meta 0 the page size is
    // unknown, so every supported size is tried.
    let sizes: Vec<usize> = match &first {
        Ok(meta) => vec![meta.page_size as usize],
        Err(_) => (MIN_PAGE_SIZE.trailing_zeros()..=MAX_PAGE_SIZE.trailing_zeros()).map(|shift| 1 << shift).collect(),
    };
    let mut second = Err(Error::InvalidFile);
    for size in sizes {
        second = read_meta(file, size as u64, 1);
        if matches!(&second, Ok(meta) if meta.page_size as usize == size) {
            break;
        }
    }

    let meta = match (first, second) {
        (Ok(a), Ok(b)) => {
            if b.txid > a.txid {
                b
            } else {
                a
            }
        }
        (Ok(a), Err(e)) => {
            warn!(error = %e, txid = a.txid, "Meta page 1 is invalid, using meta page 0");
            a
        }
        (Err(e), Ok(b)) => {
            warn!(error = %e, txid = b.txid, "Meta page 0 is invalid, using meta page 1");
            b
        }
        (Err(Error::ChecksumMismatch { .. }), Err(_)) => {
            return Err(Error::Corrupted { reason: "both meta pages are invalid".to_string() });
        }
        (Err(e), Err(_)) => return Err(e),
    };
    Ok((meta, meta.page_size as usize))
}

/// Page `id` named by `meta`, checked against its high water mark.
fn meta_page<'a>(map: &'a [u8], meta: &Meta, id: PageId, page_size: usize) -> Result<Page<'a>> {
    if id < 2 || id > meta.pgid_hi {
        return Err(Error::Corrupted {
            reason: format!("meta {} names page {id} outside 2..={}", meta.txid, meta.pgid_hi),
        });
    }
    Page::in_map(map, id, page_size)
}

fn read_directory(map: &Mmap, meta: &Meta, page_size: usize) -> Result<Directory> {
    Directory::read(meta_page(map, meta, meta.buckets, page_size)?)
}
