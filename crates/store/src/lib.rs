//! inkvault-store: an embedded, single-file, ordered key/value store.
//!
//! - **One file**: two meta pages, a freelist, a buckets directory and B+tree pages
//! - **Memory mapped reads**: values are borrowed straight from the map
//! - **MVCC**: any number of readers alongside one writer, each reader on a
//!   stable snapshot
//! - **Copy-on-write commits**: no page reachable from the live meta is ever
//!   overwritten, so a crash leaves the previous commit intact
//! - **Buckets**: named key spaces, nestable, each with its own sequence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Database                      │
//! │  (open, begin_read/write, view/update)      │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              Transaction                     │
//! │  (snapshot meta, dirty pages, commit)       │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │          Buckets and Cursors                 │
//! │  (get, put, delete, seek, nested buckets)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │               B+ Tree                        │
//! │  (nodes, rebalance, split, spill)           │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │      Pages, Freelist, Meta, Data File        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use inkvault_store::Database;
//!
//! let db = Database::open("data.ink")?;
//!
//! let mut tx = db.begin_write()?;
//! tx.create_bucket(b"widgets")?.put(b"foo", b"bar")?;
//! tx.commit()?;
//!
//! let tx = db.begin_read()?;
//! let widgets = tx.bucket(b"widgets").ok_or(inkvault_store::Error::BucketNotFound)?;
//! let mut cursor = widgets.cursor();
//! let mut item = cursor.first()?;
//! while let Some((key, value)) = item {
//!     println!("{key:?} => {value:?}");
//!     item = cursor.next()?;
//! }
//! # Ok::<(), inkvault_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod backend;
mod btree;
pub mod bucket;
pub mod db;
pub mod directory;
pub mod error;
pub mod freelist;
pub mod integrity;
pub mod page;
mod tracker;
pub mod transaction;

pub use btree::cursor::{Cursor, CursorItem};
pub use btree::split::{DEFAULT_FILL_PERCENT, MAX_FILL_PERCENT, MIN_FILL_PERCENT};
pub use bucket::{Bucket, BucketMut, BucketStats};
pub use db::{DEFAULT_FILE_MODE, Database, DatabaseOptions, DatabaseStats};
pub use directory::{BucketHeader, MAX_BUCKET_NAME_SIZE};
pub use error::{Error, PageId, Result, TxId};
pub use integrity::{CheckError, CheckReport};
pub use page::{DEFAULT_PAGE_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE, VERSION};
pub use transaction::{Transaction, TxStats};
