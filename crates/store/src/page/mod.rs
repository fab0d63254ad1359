//! Page layout for the store engine.
//!
//! Every page starts with a 16-byte header followed by a payload whose
//! interpretation depends on the page flags:
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----
//! 0       8      Page id
//! 8       2      Flags (branch, leaf, meta, buckets, freelist)
//! 10      2      Element count
//! 12      4      Overflow (extra contiguous pages owned by this page)
//! ```
//!
//! Branch and leaf pages store a fixed-size element array right after the
//! header. Each element records the offset of its key (and value) relative
//! to the start of the element itself; key/value bytes follow the array.

mod meta;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
pub use meta::{MAGIC, META_SIZE, Meta, VERSION};

use crate::error::{Error, PageId, Result};

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one branch element: pos (u32), ksize (u32), pgid (u64).
pub const BRANCH_ELEMENT_SIZE: usize = 16;

/// Size of one leaf element: flags (u32), pos (u32), ksize (u32), vsize (u32).
pub const LEAF_ELEMENT_SIZE: usize = 16;

/// Minimum entries a page keeps before it is considered for merging.
pub const MIN_KEYS_PER_PAGE: usize = 2;

/// Default page size for new databases.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted at creation.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest page size accepted at creation.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 32 * 1024;

/// Maximum value length in bytes.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize - 1;

/// Element count stored in the header when the real count lives in the payload.
pub(crate) const COUNT_OVERFLOW_MARKER: u16 = 0xFFFF;

bitflags! {
    /// Page kind flags. Exactly one is set on a well-formed page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u16 {
        /// Interior B+tree page.
        const BRANCH = 0x01;
        /// B+tree leaf page.
        const LEAF = 0x02;
        /// One of the two meta pages.
        const META = 0x04;
        /// Top-level buckets directory.
        const BUCKETS = 0x08;
        /// Freelist page.
        const FREELIST = 0x10;
    }
}

bitflags! {
    /// Per-element flags on leaf pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LeafFlags: u32 {
        /// The value is a nested bucket header.
        const BUCKET = 0x01;
    }
}

impl PageFlags {
    /// Human-readable page kind.
    pub fn kind(self) -> &'static str {
        if self == PageFlags::BRANCH {
            "branch"
        } else if self == PageFlags::LEAF {
            "leaf"
        } else if self == PageFlags::META {
            "meta"
        } else if self == PageFlags::BUCKETS {
            "buckets"
        } else if self == PageFlags::FREELIST {
            "freelist"
        } else {
            "unknown"
        }
    }
}

/// Decoded page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Page id.
    pub id: PageId,
    /// Page kind.
    pub flags: PageFlags,
    /// Number of elements in the payload.
    pub count: u16,
    /// Number of extra contiguous pages.
    pub overflow: u32,
}

impl PageHeader {
    /// Creates a header for a page with no elements.
    pub fn new(id: PageId, flags: PageFlags) -> Self {
        Self { id, flags, count: 0, overflow: 0 }
    }

    /// Serializes header to bytes.
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.id);
        LittleEndian::write_u16(&mut buf[8..10], self.flags.bits());
        LittleEndian::write_u16(&mut buf[10..12], self.count);
        LittleEndian::write_u32(&mut buf[12..16], self.overflow);
        buf
    }

    /// Deserializes header from bytes.
    ///
    /// Unknown flag bits are retained so the consistency checker can report them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the buffer is shorter than [`PAGE_HEADER_SIZE`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::Corrupted { reason: "Page header too short".to_string() });
        }

        Ok(Self {
            id: LittleEndian::read_u64(&buf[0..8]),
            flags: PageFlags::from_bits_retain(LittleEndian::read_u16(&buf[8..10])),
            count: LittleEndian::read_u16(&buf[10..12]),
            overflow: LittleEndian::read_u32(&buf[12..16]),
        })
    }
}

/// A branch element: the smallest key of a subtree and the subtree's root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchElement<'a> {
    /// Separator key.
    pub key: &'a [u8],
    /// Child page id.
    pub pgid: PageId,
}

/// A leaf element: key, value and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafElement<'a> {
    /// Element flags.
    pub flags: LeafFlags,
    /// Key bytes.
    pub key: &'a [u8],
    /// Value bytes (a bucket header when [`LeafFlags::BUCKET`] is set).
    pub value: &'a [u8],
}

impl LeafElement<'_> {
    /// Whether this element holds a nested bucket.
    pub fn is_bucket(&self) -> bool {
        self.flags.contains(LeafFlags::BUCKET)
    }
}

/// Read-only view over the bytes of one logical page (including overflow).
#[derive(Clone, Copy)]
pub struct Page<'a> {
    data: &'a [u8],
}

impl std::fmt::Debug for Page<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("kind", &self.flags().kind())
            .field("count", &self.count())
            .field("overflow", &self.overflow())
            .finish()
    }
}

impl<'a> Page<'a> {
    /// Wraps raw page bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the buffer cannot hold a page header.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(Error::Corrupted { reason: "Page header too short".to_string() });
        }
        Ok(Self { data })
    }

    /// Locates page `id` inside a mapped file image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page or its overflow run extends
    /// past the end of `map`.
    pub fn in_map(map: &'a [u8], id: PageId, page_size: usize) -> Result<Self> {
        let offset = usize::try_from(id).ok().and_then(|id| id.checked_mul(page_size));
        let in_bounds = |offset: &usize| offset.checked_add(PAGE_HEADER_SIZE).is_some_and(|end| end <= map.len());
        let Some(offset) = offset.filter(in_bounds) else {
            return Err(Error::Corrupted {
                reason: format!("page {id} is beyond the end of the map ({} bytes)", map.len()),
            });
        };
        let overflow = LittleEndian::read_u32(&map[offset + 12..offset + 16]) as usize;
        let end = offset + (overflow + 1) * page_size;
        if end > map.len() {
            return Err(Error::Corrupted {
                reason: format!("page {id} overflow of {overflow} pages runs past the map"),
            });
        }
        Ok(Self { data: &map[offset..end] })
    }

    /// Decoded header.
    pub fn header(&self) -> PageHeader {
        PageHeader {
            id: self.id(),
            flags: self.flags(),
            count: self.count(),
            overflow: self.overflow(),
        }
    }

    /// Page id recorded in the header.
    pub fn id(&self) -> PageId {
        LittleEndian::read_u64(&self.data[0..8])
    }

    /// Page kind flags.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(LittleEndian::read_u16(&self.data[8..10]))
    }

    /// Element count.
    pub fn count(&self) -> u16 {
        LittleEndian::read_u16(&self.data[10..12])
    }

    /// Extra contiguous pages owned by this page.
    pub fn overflow(&self) -> u32 {
        LittleEndian::read_u32(&self.data[12..16])
    }

    /// Whether this is a leaf page.
    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    /// Whether this is a branch page.
    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    /// Raw bytes of the whole page.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Bytes following the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Branch element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the element or its key lies outside the page bytes.
    pub fn branch_element(&self, index: usize) -> BranchElement<'a> {
        let elem = PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE;
        let pos = LittleEndian::read_u32(&self.data[elem..elem + 4]) as usize;
        let ksize = LittleEndian::read_u32(&self.data[elem + 4..elem + 8]) as usize;
        let pgid = LittleEndian::read_u64(&self.data[elem + 8..elem + 16]);
        let start = elem + pos;
        BranchElement { key: &self.data[start..start + ksize], pgid }
    }

    /// Leaf element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the element, its key or its value lies outside the page bytes.
    pub fn leaf_element(&self, index: usize) -> LeafElement<'a> {
        let elem = PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE;
        let flags = LeafFlags::from_bits_retain(LittleEndian::read_u32(&self.data[elem..elem + 4]));
        let pos = LittleEndian::read_u32(&self.data[elem + 4..elem + 8]) as usize;
        let ksize = LittleEndian::read_u32(&self.data[elem + 8..elem + 12]) as usize;
        let vsize = LittleEndian::read_u32(&self.data[elem + 12..elem + 16]) as usize;
        let start = elem + pos;
        LeafElement {
            flags,
            key: &self.data[start..start + ksize],
            value: &self.data[start + ksize..start + ksize + vsize],
        }
    }

    /// Key at `index`, for either page kind.
    pub fn key_at(&self, index: usize) -> &'a [u8] {
        if self.is_branch() {
            self.branch_element(index).key
        } else {
            self.leaf_element(index).key
        }
    }

    /// Whether the element array and every key/value referenced by it fit
    /// inside the page bytes.
    pub fn elements_in_bounds(&self) -> bool {
        let count = self.count() as usize;
        let len = self.data.len();
        let elem_size = if self.is_branch() { BRANCH_ELEMENT_SIZE } else { LEAF_ELEMENT_SIZE };
        if PAGE_HEADER_SIZE + count * elem_size > len {
            return false;
        }
        (0..count).all(|i| {
            let elem = PAGE_HEADER_SIZE + i * elem_size;
            let (pos, total) = if self.is_branch() {
                let pos = LittleEndian::read_u32(&self.data[elem..elem + 4]) as usize;
                (pos, LittleEndian::read_u32(&self.data[elem + 4..elem + 8]) as usize)
            } else {
                let pos = LittleEndian::read_u32(&self.data[elem + 4..elem + 8]) as usize;
                let ksize = LittleEndian::read_u32(&self.data[elem + 8..elem + 12]) as usize;
                let vsize = LittleEndian::read_u32(&self.data[elem + 12..elem + 16]) as usize;
                (pos, ksize + vsize)
            };
            elem.checked_add(pos).and_then(|s| s.checked_add(total)).is_some_and(|end| end <= len)
        })
    }
}

/// Mutable writer over a page buffer.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Wraps a buffer of at least [`PAGE_HEADER_SIZE`] bytes.
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert!(data.len() >= PAGE_HEADER_SIZE);
        Self { data }
    }

    /// Writes the header.
    pub fn set_header(&mut self, header: &PageHeader) {
        self.data[..PAGE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Overwrites the flags field.
    pub fn set_flags(&mut self, flags: PageFlags) {
        LittleEndian::write_u16(&mut self.data[8..10], flags.bits());
    }

    /// Overwrites the count field.
    pub fn set_count(&mut self, count: u16) {
        LittleEndian::write_u16(&mut self.data[10..12], count);
    }

    /// Page id stored in the header.
    pub fn id(&self) -> PageId {
        LittleEndian::read_u64(&self.data[0..8])
    }

    /// Bytes following the header.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Writes branch element `index` whose key starts at absolute offset `key_offset`.
    pub fn put_branch_element(&mut self, index: usize, key_offset: usize, key: &[u8], pgid: PageId) {
        let elem = PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE;
        LittleEndian::write_u32(&mut self.data[elem..elem + 4], (key_offset - elem) as u32);
        LittleEndian::write_u32(&mut self.data[elem + 4..elem + 8], key.len() as u32);
        LittleEndian::write_u64(&mut self.data[elem + 8..elem + 16], pgid);
        self.data[key_offset..key_offset + key.len()].copy_from_slice(key);
    }

    /// Writes leaf element `index` whose key starts at absolute offset `key_offset`.
    pub fn put_leaf_element(
        &mut self,
        index: usize,
        key_offset: usize,
        flags: LeafFlags,
        key: &[u8],
        value: &[u8],
    ) {
        let elem = PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE;
        LittleEndian::write_u32(&mut self.data[elem..elem + 4], flags.bits());
        LittleEndian::write_u32(&mut self.data[elem + 4..elem + 8], (key_offset - elem) as u32);
        LittleEndian::write_u32(&mut self.data[elem + 8..elem + 12], key.len() as u32);
        LittleEndian::write_u32(&mut self.data[elem + 12..elem + 16], value.len() as u32);
        let value_offset = key_offset + key.len();
        self.data[key_offset..value_offset].copy_from_slice(key);
        self.data[value_offset..value_offset + value.len()].copy_from_slice(value);
    }

    /// Read-only view of the buffer.
    pub fn as_page(&self) -> Page<'_> {
        Page { data: self.data }
    }
}

/// Number of pages needed to hold `size` bytes.
pub fn pages_for(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size).max(1)
}
