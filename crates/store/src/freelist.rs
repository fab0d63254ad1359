//! Free page tracking.
//!
//! The freelist keeps two sets:
//! - `ids`: pages ready for reuse, kept in descending order
//! - `pending`: pages released by a transaction that older readers may still
//!   be looking at, keyed by the releasing transaction id
//!
//! On disk both sets are written as one descending array: after a crash no
//! reader survives, so every pending page is free on recovery.

use std::collections::{BTreeMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, PageId, Result, TxId};
use crate::page::{COUNT_OVERFLOW_MARKER, PAGE_HEADER_SIZE, Page, PageFlags, PageMut};

/// Free and pending page ids.
#[derive(Debug, Clone, Default)]
pub struct Freelist {
    /// Free ids, descending.
    ids: Vec<PageId>,
    /// Ids released per transaction, not yet reusable.
    pending: BTreeMap<TxId, Vec<PageId>>,
    /// Every id in `ids` or `pending`.
    cache: HashSet<PageId>,
}

impl Freelist {
    /// Creates an empty freelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of free ids.
    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of pending ids across all transactions.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Total ids tracked.
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Free ids, descending.
    pub fn free_ids(&self) -> &[PageId] {
        &self.ids
    }

    /// Pending ids, descending.
    pub fn pending_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.pending.values().flatten().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    /// Union of free and pending ids, descending.
    pub fn all(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.ids.iter().chain(self.pending.values().flatten()).copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    /// Whether `id` is free or pending.
    pub fn contains(&self, id: PageId) -> bool {
        self.cache.contains(&id)
    }

    /// Serialised size in bytes, header included.
    pub fn size(&self) -> usize {
        let n = self.count();
        let n = if n >= COUNT_OVERFLOW_MARKER as usize { n + 1 } else { n };
        PAGE_HEADER_SIZE + n * 8
    }

    /// Takes a contiguous run of `n` free ids and returns its lowest id, or 0
    /// when no run fits and the caller must extend the file.
    pub fn allocate(&mut self, n: usize) -> PageId {
        if n == 0 {
            return 0;
        }

        let mut initial: PageId = 0;
        let mut previous: PageId = 0;
        for i in 0..self.ids.len() {
            let id = self.ids[i];
            debug_assert!(id > 1, "page {id} must never be free");

            if previous == 0 || previous - id != 1 {
                initial = id;
            }

            if initial - id + 1 == n as PageId {
                self.ids.drain(i + 1 - n..=i);
                for page in id..=initial {
                    self.cache.remove(&page);
                }
                return id;
            }

            previous = id;
        }
        0
    }

    /// Releases page `id` and its `overflow` pages on behalf of `txid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] when a meta page or an already-free page
    /// is freed.
    pub fn free(&mut self, txid: TxId, id: PageId, overflow: u32) -> Result<()> {
        let ids = self.claim(id, overflow)?;
        self.pending.entry(txid).or_default().extend(ids);
        Ok(())
    }

    /// Returns pages straight to the free set. Used for pages that were
    /// allocated and released by the same transaction, which no reader can see.
    ///
    /// # Errors
    ///
    /// Same as [`Freelist::free`].
    pub fn reclaim(&mut self, id: PageId, overflow: u32) -> Result<()> {
        for page in self.claim(id, overflow)? {
            let pos = self.ids.partition_point(|&existing| existing > page);
            self.ids.insert(pos, page);
        }
        Ok(())
    }

    fn claim(&mut self, id: PageId, overflow: u32) -> Result<Vec<PageId>> {
        if id <= 1 {
            return Err(Error::Corrupted { reason: format!("cannot free meta page {id}") });
        }
        let ids: Vec<PageId> = (id..=id + PageId::from(overflow)).collect();
        if let Some(dup) = ids.iter().find(|page| self.cache.contains(page)) {
            return Err(Error::Corrupted { reason: format!("page {dup} already freed") });
        }
        self.cache.extend(ids.iter().copied());
        Ok(ids)
    }

    /// Moves every pending batch with txid ≤ `txid` into the free set.
    /// Returns the number of ids released.
    pub fn release(&mut self, txid: TxId) -> usize {
        let keep = self.pending.split_off(&(txid.saturating_add(1)));
        let released = std::mem::replace(&mut self.pending, keep);
        let mut count = 0;
        for ids in released.into_values() {
            count += ids.len();
            self.ids.extend(ids);
        }
        if count > 0 {
            self.ids.sort_unstable_by(|a, b| b.cmp(a));
        }
        count
    }

    /// Loads ids from a freelist page. Everything read is free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page is not a freelist page or the
    /// id array does not fit the page bytes.
    pub fn read(page: Page<'_>) -> Result<Self> {
        if page.flags() != PageFlags::FREELIST {
            return Err(Error::Corrupted {
                reason: format!("page {} is a {} page, expected freelist", page.id(), page.flags().kind()),
            });
        }

        let payload = page.payload();
        let (count, start) = if page.count() == COUNT_OVERFLOW_MARKER {
            if payload.len() < 8 {
                return Err(Error::Corrupted { reason: "freelist count missing".to_string() });
            }
            (LittleEndian::read_u64(&payload[0..8]) as usize, 8)
        } else {
            (page.count() as usize, 0)
        };
        let end = count.checked_mul(8).and_then(|len| len.checked_add(start));
        let Some(end) = end.filter(|&end| end <= payload.len()) else {
            return Err(Error::Corrupted {
                reason: format!("freelist of {count} ids overruns page {}", page.id()),
            });
        };

        let mut ids: Vec<PageId> = payload[start..end]
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let cache = ids.iter().copied().collect();
        Ok(Self { ids, pending: BTreeMap::new(), cache })
    }

    /// Writes free and pending ids into a buffer of at least [`Freelist::size`] bytes.
    /// The page header id and overflow must already be set.
    pub fn write(&self, page: &mut PageMut<'_>) {
        let ids = self.all();
        page.set_flags(PageFlags::FREELIST);

        let payload = page.payload_mut();
        let start = if ids.len() >= COUNT_OVERFLOW_MARKER as usize {
            LittleEndian::write_u64(&mut payload[0..8], ids.len() as u64);
            8
        } else {
            0
        };
        for (i, id) in ids.iter().enumerate() {
            let offset = start + i * 8;
            LittleEndian::write_u64(&mut payload[offset..offset + 8], *id);
        }

        let count = if start == 0 { ids.len() as u16 } else { COUNT_OVERFLOW_MARKER };
        page.set_count(count);
    }
}
