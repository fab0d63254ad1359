//! Reader registry for safe page reclamation.
//!
//! Pages freed by a write transaction stay pending until no open read
//! transaction can still reach them. A reader registered at `txid` sees the
//! tree as of that commit, so pages freed by transactions up to and
//! including `txid` are no longer visible to it.
//!
//! # Example
//!
//! ```text
//! Reader A registers at txid 5
//! Writer 6 frees pages 10, 11 → pending[6]
//! Writer 7 frees page 12     → pending[7]
//! Reader A ends, no readers left
//!   → release(current txid 7): pages 10, 11, 12 become free
//! ```

use std::collections::BTreeMap;

use crate::error::TxId;

/// Open read transactions, counted per transaction id.
#[derive(Debug, Default)]
pub(crate) struct ReaderTracker {
    readers: BTreeMap<TxId, usize>,
}

impl ReaderTracker {
    pub(crate) fn register(&mut self, txid: TxId) {
        *self.readers.entry(txid).or_insert(0) += 1;
    }

    pub(crate) fn unregister(&mut self, txid: TxId) {
        if let Some(count) = self.readers.get_mut(&txid) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&txid);
            }
        }
    }

    /// Transaction id of the oldest open reader.
    pub(crate) fn oldest(&self) -> Option<TxId> {
        self.readers.keys().next().copied()
    }

    /// Number of open readers.
    pub(crate) fn len(&self) -> usize {
        self.readers.values().sum()
    }

    /// Highest transaction id whose freed pages no reader can see, given the
    /// last committed transaction id.
    pub(crate) fn release_threshold(&self, committed: TxId) -> TxId {
        self.oldest().unwrap_or(committed)
    }
}
