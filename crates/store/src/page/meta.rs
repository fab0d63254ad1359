//! Meta page encoding.
//!
//! Pages 0 and 1 each hold a meta record. The live one is the record with the
//! largest transaction id whose checksum verifies; commits alternate between
//! the two slots by `txid % 2`.
//!
//! ```text
//! Offset  Size   Field (relative to the payload)
//! ------  ----   -----
//! 0       4      Magic (0xED0CDAED)
//! 4       4      Format version
//! 8       4      Page size
//! 12      4      Flags (reserved)
//! 16      8      Buckets directory page id
//! 24      8      Freelist page id
//! 32      8      Highest allocated page id
//! 40      8      Transaction id
//! 48      8      FNV-1a 64 checksum of bytes 0..48
//! ```

use byteorder::{ByteOrder, LittleEndian};
use fnv_rs::{Fnv64, FnvHasher};

use super::{PAGE_HEADER_SIZE, PageFlags, PageHeader};
use crate::error::{Error, PageId, Result, TxId};

/// Magic number identifying an inkvault file.
pub const MAGIC: u32 = 0xED0C_DAED;

/// On-disk format version.
pub const VERSION: u32 = 2;

/// Encoded size of a meta record.
pub const META_SIZE: usize = 56;

const CHECKSUM_OFFSET: usize = 48;

/// Decoded meta record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// Magic number.
    pub magic: u32,
    /// Format version.
    pub version: u32,
    /// Page size chosen at creation.
    pub page_size: u32,
    /// Reserved flags.
    pub flags: u32,
    /// Page id of the buckets directory.
    pub buckets: PageId,
    /// Page id of the freelist.
    pub freelist: PageId,
    /// Highest allocated page id.
    pub pgid_hi: PageId,
    /// Transaction id that wrote this record.
    pub txid: TxId,
    /// Checksum as stored on disk.
    pub checksum: u64,
}

impl Meta {
    /// Meta record for a freshly initialised file.
    pub fn new(page_size: u32, txid: TxId, freelist: PageId, buckets: PageId, pgid_hi: PageId) -> Self {
        let mut meta = Self {
            magic: MAGIC,
            version: VERSION,
            page_size,
            flags: 0,
            buckets,
            freelist,
            pgid_hi,
            txid,
            checksum: 0,
        };
        meta.checksum = meta.sum64();
        meta
    }

    /// Decodes a record from the payload of a meta page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `buf` is shorter than [`META_SIZE`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(Error::Corrupted { reason: "Meta record too short".to_string() });
        }
        Ok(Self {
            magic: LittleEndian::read_u32(&buf[0..4]),
            version: LittleEndian::read_u32(&buf[4..8]),
            page_size: LittleEndian::read_u32(&buf[8..12]),
            flags: LittleEndian::read_u32(&buf[12..16]),
            buckets: LittleEndian::read_u64(&buf[16..24]),
            freelist: LittleEndian::read_u64(&buf[24..32]),
            pgid_hi: LittleEndian::read_u64(&buf[32..40]),
            txid: LittleEndian::read_u64(&buf[40..48]),
            checksum: LittleEndian::read_u64(&buf[48..56]),
        })
    }

    /// Encodes the record, checksum included as stored.
    pub fn to_bytes(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.version);
        LittleEndian::write_u32(&mut buf[8..12], self.page_size);
        LittleEndian::write_u32(&mut buf[12..16], self.flags);
        LittleEndian::write_u64(&mut buf[16..24], self.buckets);
        LittleEndian::write_u64(&mut buf[24..32], self.freelist);
        LittleEndian::write_u64(&mut buf[32..40], self.pgid_hi);
        LittleEndian::write_u64(&mut buf[40..48], self.txid);
        LittleEndian::write_u64(&mut buf[48..56], self.checksum);
        buf
    }

    /// FNV-1a 64 over every field preceding the checksum.
    pub fn sum64(&self) -> u64 {
        let bytes = self.to_bytes();
        let digest = Fnv64::hash(&bytes[..CHECKSUM_OFFSET]);
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(out)
    }

    /// Checks magic, version and checksum, in that order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidFile`] on magic mismatch.
    /// - [`Error::VersionMismatch`] on an unknown format version.
    /// - [`Error::ChecksumMismatch`] when the stored checksum does not verify.
    pub fn validate(&self, page_id: PageId) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidFile);
        }
        if self.version != VERSION {
            return Err(Error::VersionMismatch { found: self.version, expected: VERSION });
        }
        if self.checksum != self.sum64() {
            return Err(Error::ChecksumMismatch { page_id });
        }
        Ok(())
    }

    /// Meta slot this record is written to.
    pub fn slot(&self) -> PageId {
        self.txid % 2
    }

    /// Serialises a complete meta page (header and record) into `buf`,
    /// refreshing the checksum first.
    pub fn write_page(&mut self, buf: &mut [u8]) {
        self.checksum = self.sum64();
        let header = PageHeader::new(self.slot(), PageFlags::META);
        buf[..PAGE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE].copy_from_slice(&self.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Meta {
        Meta::new(4096, 7, 2, 3, 3)
    }

    #[test]
    fn test_meta_roundtrip_and_validate() {
        let meta = sample();
        let parsed = Meta::from_bytes(&meta.to_bytes()).unwrap();
        assert_eq!(parsed, meta);
        parsed.validate(1).unwrap();
    }

    #[test]
    fn test_meta_checksum_is_fnv1a_of_fields() {
        // Reference FNV-1a 64 computed by hand over the first 48 bytes.
        let meta = sample();
        let bytes = meta.to_bytes();
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in &bytes[..CHECKSUM_OFFSET] {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        assert_eq!(meta.checksum, hash);
    }

    #[test]
    fn test_validate_invalid_magic() {
        let mut meta = sample();
        meta.magic = 0xDEAD_BEEF;
        meta.checksum = meta.sum64();
        assert!(matches!(meta.validate(0), Err(Error::InvalidFile)));
    }

    #[test]
    fn test_validate_version_mismatch() {
        let mut meta = sample();
        meta.version = VERSION + 1;
        meta.checksum = meta.sum64();
        assert!(matches!(meta.validate(0), Err(Error::VersionMismatch { found, .. }) if found == VERSION + 1));
    }

    #[test]
    fn test_validate_checksum_mismatch() {
        let mut meta = sample();
        meta.txid += 1;
        assert!(matches!(meta.validate(1), Err(Error::ChecksumMismatch { page_id: 1 })));
    }

    #[test]
    fn test_write_page_uses_alternate_slots() {
        let mut buf = vec![0u8; 4096];
        let mut meta = sample();
        meta.txid = 8;
        meta.write_page(&mut buf);
        let header = PageHeader::from_bytes(&buf).unwrap();
        assert_eq!(header.id, 0);
        assert_eq!(header.flags, PageFlags::META);

        let parsed = Meta::from_bytes(&buf[PAGE_HEADER_SIZE..]).unwrap();
        parsed.validate(0).unwrap();
        assert_eq!(parsed.txid, 8);

        meta.txid = 9;
        assert_eq!(meta.slot(), 1);
    }
}
