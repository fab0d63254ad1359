//! Data file handle using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads and writes go through [`std::os::unix::fs::FileExt`]:
//! `read_exact_at()`/`write_all_at()` take `&self` and never touch the file
//! cursor. The engine's single-writer lock already serializes writes, so no
//! extra guard is needed here.
//!
//! The file carries an advisory lock (`flock` on Unix, `LockFileEx` on
//! Windows) for as long as it is open: exclusive for writable handles,
//! shared for read-only ones.

use std::fs::{File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::Mmap;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Smallest map size.
const MIN_MMAP_SIZE: usize = 1 << 15;

/// Map sizes double up to this size, then grow in steps of it.
const MAX_MMAP_STEP: usize = 1 << 30;

/// Largest map the engine will create.
#[cfg(target_pointer_width = "64")]
const MAX_MAP_SIZE: u64 = 0xFFFF_FFFF_FFFF;
#[cfg(not(target_pointer_width = "64"))]
const MAX_MAP_SIZE: u64 = 0x7FFF_FFFF;

/// Map size to use for a file of at least `size` bytes.
///
/// Sizes double from 32 KiB up to 1 GiB, then grow in 1 GiB steps rounded
/// to `page_size`.
///
/// # Errors
///
/// Returns [`Error::MapTooLarge`] past the address-space cap.
pub(crate) fn mmap_size(size: u64, page_size: usize) -> Result<u64> {
    let mut shift = MIN_MMAP_SIZE.trailing_zeros();
    while (1u64 << shift) <= MAX_MMAP_STEP as u64 {
        if size <= 1u64 << shift {
            return Ok(1u64 << shift);
        }
        shift += 1;
    }

    if size > MAX_MAP_SIZE {
        return Err(Error::MapTooLarge { size });
    }

    let step = MAX_MMAP_STEP as u64;
    let mut sz = size.div_ceil(step) * step;
    let page_size = page_size as u64;
    sz = sz.div_ceil(page_size) * page_size;
    Ok(sz.min(MAX_MAP_SIZE))
}

/// Open data file with its advisory lock held.
pub(crate) struct DataFile {
    file: File,
    /// Second handle used only for meta page writes.
    meta_file: File,
    path: PathBuf,
    read_only: bool,
}

impl DataFile {
    /// Opens (creating unless `read_only`) the file at `path` and takes the
    /// advisory lock without blocking.
    ///
    /// # Errors
    ///
    /// - [`Error::DatabaseAlreadyOpen`] if another handle holds a conflicting lock.
    /// - [`Error::Io`] if the file cannot be opened.
    pub(crate) fn open(path: &Path, read_only: bool, mode: u32) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true).create(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let file = options.open(path)?;

        let locked =
            if read_only { FileExt::try_lock_shared(&file) } else { FileExt::try_lock_exclusive(&file) };
        if let Err(e) = locked {
            // Some platforms report a held lock as EAGAIN (11 on Linux, 35 on macOS).
            if e.kind() == io::ErrorKind::WouldBlock || matches!(e.raw_os_error(), Some(11 | 35)) {
                error!(path = %path.display(), "Database file is locked by another handle");
                return Err(Error::DatabaseAlreadyOpen);
            }
            return Err(e.into());
        }
        debug!(path = %path.display(), read_only, "Acquired advisory lock");

        let meta_file = if read_only {
            file.try_clone()?
        } else {
            OpenOptions::new().write(true).open(path)?
        };

        Ok(Self { file, meta_file, path: path.to_path_buf(), read_only })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes.
    pub(crate) fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        read_exact_at_offset(&self.file, buf, offset)
    }

    /// Writes all of `data` at `offset`.
    pub(crate) fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        write_all_at_offset(&self.file, data, offset)
    }

    /// Writes a meta page through the meta handle, syncing it unless `sync` is false.
    pub(crate) fn write_meta(&self, data: &[u8], offset: u64, sync: bool) -> Result<()> {
        if self.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        write_all_at_offset(&self.meta_file, data, offset)?;
        if sync {
            self.meta_file.sync_data()?;
        }
        Ok(())
    }

    /// Flushes written data to disk.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Extends the file to `size` bytes. Metadata is synced unless `sync` is false.
    pub(crate) fn grow(&self, size: u64, sync: bool) -> Result<()> {
        if self.len()? >= size {
            return Ok(());
        }
        self.file.set_len(size)?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Maps the whole file read-only.
    pub(crate) fn map(&self) -> Result<Mmap> {
        // SAFETY: Mmap::map is unsafe because the mapped file may be modified
        // or truncated behind the map's back. This is sound here because:
        // 1. The advisory lock keeps other handles of this engine out while
        //    the file is open writable
        // 2. The file is only ever extended, never truncated, while mapped
        // 3. Pages a live map exposes to readers are never rewritten until no
        //    reader can reach them
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&self.file)? };
        Ok(map)
    }

    /// Releases the advisory lock.
    pub(crate) fn unlock(&self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Windows fallback: `seek_read` updates the file cursor.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
