//! Top-level buckets directory.
//!
//! The directory maps bucket names to their B+tree roots and lives on its own
//! page (with overflow if needed). Entries are kept sorted by name:
//!
//! ```text
//! u8 name_len | name bytes | u64 root pgid | u64 sequence
//! ```

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, PageId, Result};
use crate::page::{PAGE_HEADER_SIZE, Page, PageFlags, PageMut};

/// Maximum bucket name length in bytes.
pub const MAX_BUCKET_NAME_SIZE: usize = 255;

/// Encoded size of a [`BucketHeader`].
pub const BUCKET_HEADER_SIZE: usize = 16;

/// Persistent state of one bucket: its root page and sequence counter.
///
/// Top-level buckets keep it in the directory; nested buckets keep the same
/// 16 bytes as the value of a leaf element flagged as a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketHeader {
    /// Root page of the bucket's B+tree.
    pub root: PageId,
    /// Last value returned by `next_sequence`.
    pub sequence: u64,
}

impl BucketHeader {
    /// Header for a bucket rooted at `root`.
    pub fn new(root: PageId) -> Self {
        Self { root, sequence: 0 }
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; BUCKET_HEADER_SIZE] {
        let mut buf = [0u8; BUCKET_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.root);
        LittleEndian::write_u64(&mut buf[8..16], self.sequence);
        buf
    }

    /// Deserializes a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `buf` is not exactly [`BUCKET_HEADER_SIZE`] bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != BUCKET_HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("bucket header is {} bytes, expected {BUCKET_HEADER_SIZE}", buf.len()),
            });
        }
        Ok(Self {
            root: LittleEndian::read_u64(&buf[0..8]),
            sequence: LittleEndian::read_u64(&buf[8..16]),
        })
    }
}

/// Checks a bucket name against the directory limits.
///
/// # Errors
///
/// - [`Error::BucketNameRequired`] for an empty name.
/// - [`Error::BucketNameTooLarge`] past [`MAX_BUCKET_NAME_SIZE`] bytes.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BucketNameRequired);
    }
    if name.len() > MAX_BUCKET_NAME_SIZE {
        return Err(Error::BucketNameTooLarge { len: name.len(), max: MAX_BUCKET_NAME_SIZE });
    }
    Ok(())
}

/// Sorted name → bucket header map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<Vec<u8>, BucketHeader>,
}

impl Directory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the directory from a buckets page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page is not a buckets page or an
    /// entry runs past the page bytes.
    pub fn read(page: Page<'_>) -> Result<Self> {
        if page.flags() != PageFlags::BUCKETS {
            return Err(Error::Corrupted {
                reason: format!("page {} is a {} page, expected buckets", page.id(), page.flags().kind()),
            });
        }

        let payload = page.payload();
        let mut entries = BTreeMap::new();
        let mut offset = 0;
        for _ in 0..page.count() {
            let overrun = || Error::Corrupted {
                reason: format!("buckets directory entry overruns page {}", page.id()),
            };
            let name_len = *payload.get(offset).ok_or_else(overrun)? as usize;
            let name_end = offset + 1 + name_len;
            let entry_end = name_end + BUCKET_HEADER_SIZE;
            if entry_end > payload.len() {
                return Err(overrun());
            }
            let name = payload[offset + 1..name_end].to_vec();
            let header = BucketHeader::from_bytes(&payload[name_end..entry_end])?;
            entries.insert(name, header);
            offset = entry_end;
        }
        Ok(Self { entries })
    }

    /// Serialised size in bytes, header included.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self.entries.keys().map(|name| 1 + name.len() + BUCKET_HEADER_SIZE).sum::<usize>()
    }

    /// Writes the entries into a buffer of at least [`Directory::size`] bytes.
    /// The page header id and overflow must already be set.
    pub fn write(&self, page: &mut PageMut<'_>) {
        page.set_flags(PageFlags::BUCKETS);
        page.set_count(self.entries.len() as u16);

        let payload = page.payload_mut();
        let mut offset = 0;
        for (name, header) in &self.entries {
            payload[offset] = name.len() as u8;
            payload[offset + 1..offset + 1 + name.len()].copy_from_slice(name);
            offset += 1 + name.len();
            payload[offset..offset + BUCKET_HEADER_SIZE].copy_from_slice(&header.to_bytes());
            offset += BUCKET_HEADER_SIZE;
        }
    }

    /// Header of bucket `name`.
    pub fn get(&self, name: &[u8]) -> Option<&BucketHeader> {
        self.entries.get(name)
    }

    /// Inserts or replaces bucket `name`.
    pub fn put(&mut self, name: &[u8], header: BucketHeader) {
        self.entries.insert(name.to_vec(), header);
    }

    /// Removes bucket `name`, returning its header.
    pub fn delete(&mut self, name: &[u8]) -> Option<BucketHeader> {
        self.entries.remove(name)
    }

    /// Bucket names and headers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &BucketHeader)> {
        self.entries.iter().map(|(name, header)| (name.as_slice(), header))
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no buckets.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageHeader, pages_for};

    #[test]
    fn test_get_put_delete() {
        let mut dir = Directory::new();
        dir.put(b"widgets", BucketHeader::new(10));
        dir.put(b"apples", BucketHeader::new(11));

        assert_eq!(dir.get(b"widgets"), Some(&BucketHeader::new(10)));
        assert_eq!(dir.get(b"missing"), None);
        let names: Vec<&[u8]> = dir.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec![&b"apples"[..], &b"widgets"[..]]);

        assert_eq!(dir.delete(b"apples"), Some(BucketHeader::new(11)));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_write_and_read_page() {
        let mut dir = Directory::new();
        dir.put(b"foo", BucketHeader { root: 4, sequence: 9 });
        dir.put(&[b'x'; MAX_BUCKET_NAME_SIZE], BucketHeader::new(5));

        let page_size = 256;
        let pages = pages_for(dir.size(), page_size);
        let mut buf = vec![0u8; pages * page_size];
        let mut page = PageMut::new(&mut buf);
        page.set_header(&PageHeader {
            id: 3,
            flags: PageFlags::BUCKETS,
            count: 0,
            overflow: pages as u32 - 1,
        });
        dir.write(&mut page);

        let loaded = Directory::read(Page::from_bytes(&buf).unwrap()).unwrap();
        assert_eq!(loaded, dir);
        assert_eq!(loaded.get(b"foo").map(|h| h.sequence), Some(9));
    }

    #[test]
    fn test_read_truncated_entry() {
        let mut buf = vec![0u8; 32];
        let mut page = PageMut::new(&mut buf);
        page.set_header(&PageHeader { id: 3, flags: PageFlags::BUCKETS, count: 1, overflow: 0 });
        page.payload_mut()[0] = 200;
        assert!(matches!(Directory::read(Page::from_bytes(&buf).unwrap()), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_validate_name() {
        assert!(matches!(validate_name(b""), Err(Error::BucketNameRequired)));
        assert!(validate_name(&[b'a'; 255]).is_ok());
        assert!(matches!(
            validate_name(&[b'a'; 256]),
            Err(Error::BucketNameTooLarge { len: 256, max: 255 })
        ));
    }

    #[test]
    fn test_bucket_header_bytes() {
        let header = BucketHeader { root: 77, sequence: 3 };
        assert_eq!(BucketHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        assert!(BucketHeader::from_bytes(&[0u8; 8]).is_err());
    }
}
