//! Shared test utilities for inkvault crates.
//!
//! - [`TestDir`] - Scratch directory with raw access to its data file
//! - [`strategies`] - Proptest generators for keys, values and operations
//! - [`crash_injector`] - Simulated crashes at points of the commit sequence

#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod test_dir;
pub use test_dir::{DB_FILE_NAME, TestDir};

pub mod crash_injector;
pub use crash_injector::{CrashImage, CrashPoint, damage_meta};

pub mod strategies;
