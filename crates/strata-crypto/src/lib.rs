//! Checksum capability for Strata.
//!
//! Provides domain-separated CRC32 and BLAKE3 payload checksums and the
//! [`ChecksumScope`] that decides which layers verify them. The request
//! engine only needs `compute` and `verify`; a mismatch is always a hard
//! integrity failure.

pub mod checksum;
pub mod scope;

pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumError, Checksummer};
pub use scope::ChecksumScope;
