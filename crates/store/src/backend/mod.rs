//! Data file access for the store engine.
//!
//! The engine never writes through the memory map. Pages are written with
//! positional writes on the data file handle and become visible to readers
//! through the shared read-only map once the file has been synced.
//!
//! # Crash Safety: Two Meta Pages
//!
//! - Pages 0 and 1 each hold a checksummed meta record
//! - A commit writes every new page first, syncs, then writes the meta record
//!   to slot `txid % 2` through a separate handle and syncs again
//! - Recovery picks the valid record with the larger transaction id
//!
//! A crash at any point leaves at least one meta record that only points at
//! durable pages.

mod file;

pub(crate) use file::{DataFile, mmap_size};
