//! Proptest strategies for inkvault keys, values and operation sequences.
//!
//! # Usage
//!
//! ```no_run
//! use inkvault_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_operations()) {
//!         // apply ops to a bucket and to a BTreeMap model
//!     }
//! }
//! ```

use proptest::prelude::*;

/// Longest bucket name a directory entry can hold.
pub const MAX_BUCKET_NAME: usize = 255;

/// A single mutation applied to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Insert or replace `key`.
    Put {
        /// Key to write.
        key: Vec<u8>,
        /// Value to store.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// Key to remove.
        key: Vec<u8>,
    },
}

impl Op {
    /// Key this operation touches.
    pub fn key(&self) -> &[u8] {
        match self {
            Op::Put { key, .. } | Op::Delete { key } => key,
        }
    }
}

/// Generates a non-empty key of 1-63 random bytes.
pub fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..64)
}

/// Generates a key drawn from a small alphabet so operations collide often.
pub fn arb_dense_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(b'a'..=b'f', 1..4)
}

/// Generates a value of 0-511 random bytes.
pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..512)
}

/// Generates a value large enough to need an overflow page at 4 KiB pages.
pub fn arb_large_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 4096..12288)
}

/// Generates a valid bucket name of 1-255 bytes.
pub fn arb_bucket_name() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..=MAX_BUCKET_NAME)
}

/// Generates a put or a delete, weighted toward puts.
pub fn arb_operation() -> impl Strategy<Value = Op> {
    let key = prop_oneof![3 => arb_dense_key(), 1 => arb_key()];
    prop_oneof![
        3 => (key.clone(), arb_value()).prop_map(|(key, value)| Op::Put { key, value }),
        1 => key.prop_map(|key| Op::Delete { key }),
    ]
}

/// Generates 1-199 operations.
pub fn arb_operations() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(arb_operation(), 1..200)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn keys_are_never_empty(op in arb_operation()) {
            prop_assert!(!op.key().is_empty());
        }

        #[test]
        fn bucket_names_fit_directory_entries(name in arb_bucket_name()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.len() <= MAX_BUCKET_NAME);
        }

        #[test]
        fn large_values_exceed_one_page(value in arb_large_value()) {
            prop_assert!(value.len() >= 4096);
        }
    }
}
