//! Error types for the inkvault storage engine.

use std::io;

use snafu::Snafu;

/// Page identifier type.
pub type PageId = u64;

/// Transaction identifier type.
pub type TxId = u64;

/// Result type alias for inkvault operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during inkvault operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying data file.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The database handle has been closed.
    #[snafu(display("Database not open"))]
    DatabaseNotOpen,

    /// Another handle holds the advisory lock on the data file.
    #[snafu(display("Database already open"))]
    DatabaseAlreadyOpen,

    /// A write transaction was requested on a read-only handle.
    #[snafu(display("Database is read-only"))]
    DatabaseReadOnly,

    /// The file is not an inkvault database (bad magic number).
    #[snafu(display("Invalid database file"))]
    InvalidFile,

    /// The file was written by an incompatible format version.
    #[snafu(display("Version mismatch: found {found}, expected {expected}"))]
    VersionMismatch {
        /// Version recorded in the meta page.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// Database file is corrupted or has invalid structure.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// A meta page failed checksum verification.
    #[snafu(display("Meta page {page_id} checksum mismatch"))]
    ChecksumMismatch {
        /// The meta page whose checksum failed.
        page_id: PageId,
    },

    /// Mutation attempted through a read-only transaction.
    #[snafu(display("Transaction not writable"))]
    TxNotWritable,

    /// A write transaction is already active.
    #[snafu(display("Write transaction already in progress"))]
    TxInProgress,

    /// The named bucket does not exist.
    #[snafu(display("Bucket not found"))]
    BucketNotFound,

    /// A bucket with this name already exists.
    #[snafu(display("Bucket already exists"))]
    BucketExists,

    /// Bucket names must be non-empty.
    #[snafu(display("Bucket name required"))]
    BucketNameRequired,

    /// Bucket name exceeds the directory entry limit.
    #[snafu(display("Bucket name too large: {len} bytes (max {max})"))]
    BucketNameTooLarge {
        /// Length of the rejected name.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The key names a sub-bucket where a value was expected, or vice versa.
    #[snafu(display("Incompatible value"))]
    IncompatibleValue,

    /// Keys must be non-empty.
    #[snafu(display("Key required"))]
    KeyRequired,

    /// Key exceeds the maximum key size.
    #[snafu(display("Key too large: {len} bytes (max {max})"))]
    KeyTooLarge {
        /// Length of the rejected key.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Value exceeds the maximum value size.
    #[snafu(display("Value too large: {len} bytes (max {max})"))]
    ValueTooLarge {
        /// Length of the rejected value.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Page size is not a power of two within the supported range.
    #[snafu(display("Invalid page size: {size}"))]
    InvalidPageSize {
        /// The rejected page size.
        size: usize,
    },

    /// The memory map would exceed the supported address-space size.
    #[snafu(display("Memory map too large: {size} bytes"))]
    MapTooLarge {
        /// Requested map size in bytes.
        size: u64,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}
