//! Crash simulation on data file images.
//!
//! A commit writes its pages first and its meta page last, each step
//! followed by a sync:
//!
//! ```text
//! write pages → sync → write meta(txid % 2) → sync
//!             ↑                ↑                  ↑
//!     DuringPageWrite    BeforeMetaWrite / TornMetaWrite    AfterMetaWrite
//! ```
//!
//! [`CrashImage`] snapshots the file before a commit. After the commit has
//! finished and the database is closed, [`CrashImage::apply`] rewrites the
//! file into the state a crash at the chosen [`CrashPoint`] would have left.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Points in the commit sequence where a crash is simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Some new pages reached the disk as garbage and the meta page was never
    /// written. Recovery must use the previous commit.
    DuringPageWrite,

    /// Every page was written and synced, the meta page was not.
    /// Recovery must use the previous commit.
    BeforeMetaWrite,

    /// The meta page write was cut short, leaving a record whose checksum
    /// fails. Recovery must fall back to the other meta page.
    TornMetaWrite,

    /// The commit completed. Recovery must see it.
    AfterMetaWrite,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [CrashPoint; 4] = [
        CrashPoint::DuringPageWrite,
        CrashPoint::BeforeMetaWrite,
        CrashPoint::TornMetaWrite,
        CrashPoint::AfterMetaWrite,
    ];

    /// Whether a commit interrupted here must be visible after recovery.
    pub fn survives(self) -> bool {
        matches!(self, CrashPoint::AfterMetaWrite)
    }
}

/// Snapshot of a data file taken before a commit.
#[derive(Debug, Clone)]
pub struct CrashImage {
    path: PathBuf,
    page_size: usize,
    before: Vec<u8>,
}

impl CrashImage {
    /// Reads the current contents of the data file at `path`.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from reading the file.
    pub fn capture(path: impl AsRef<Path>, page_size: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let before = fs::read(&path)?;
        Ok(Self { path, page_size, before })
    }

    /// Rewrites the file as a crash at `point` during the commit made since
    /// [`CrashImage::capture`] would have left it. The database must be closed.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from reading or writing the file.
    pub fn apply(&self, point: CrashPoint) -> io::Result<()> {
        let mut after = fs::read(&self.path)?;
        let metas = 2 * self.page_size;
        if after.len() < metas || self.before.len() < metas {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "file shorter than two meta pages"));
        }

        match point {
            CrashPoint::AfterMetaWrite => return Ok(()),
            CrashPoint::BeforeMetaWrite => {
                after[..metas].copy_from_slice(&self.before[..metas]);
            }
            CrashPoint::TornMetaWrite => {
                let slot = self.changed_meta_slot(&after).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "no meta page changed since capture")
                })?;
                // Keep the first half of the new record and the rest of the old one.
                let start = slot * self.page_size;
                let split = start + 16 + 28;
                after[split..start + self.page_size]
                    .copy_from_slice(&self.before[split..start + self.page_size]);
            }
            CrashPoint::DuringPageWrite => {
                after[..metas].copy_from_slice(&self.before[..metas]);
                for (i, page) in after.chunks_mut(self.page_size).enumerate().skip(2) {
                    let offset = i * self.page_size;
                    let old = self.before.get(offset..offset + page.len());
                    if old != Some(&*page) {
                        page.fill(0xDB);
                    }
                }
            }
        }
        fs::write(&self.path, after)
    }

    fn changed_meta_slot(&self, after: &[u8]) -> Option<usize> {
        (0..2).find(|slot| {
            let range = slot * self.page_size..(slot + 1) * self.page_size;
            after[range.clone()] != self.before[range]
        })
    }
}

/// Flips one byte inside the meta record on `slot` so its checksum fails.
///
/// # Errors
///
/// Returns any I/O error from reading or writing the file.
pub fn damage_meta(path: impl AsRef<Path>, page_size: usize, slot: usize) -> io::Result<()> {
    let path = path.as_ref();
    let mut bytes = fs::read(path)?;
    // Header is 16 bytes; the pgid_hi field sits 32 bytes into the record.
    let offset = slot * page_size + 16 + 32;
    let byte = bytes
        .get_mut(offset)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "meta slot past end of file"))?;
    *byte ^= 0xFF;
    fs::write(path, bytes)
}
