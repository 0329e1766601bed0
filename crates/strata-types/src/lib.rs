//! Foundation types for Strata.
//!
//! This crate provides the identifier and version types shared by every other
//! Strata crate, together with the rank-partitioned id allocator that lets
//! independent client processes mint unique identifiers without a round trip
//! to the storage service.
//!
//! # Key Types
//!
//! - [`ObjectId`] — Identifier of a remote object, tagged with its [`ObjectClass`]
//! - [`SequenceId`] — Globally ordered identifier assigned to each request
//! - [`Version`] — Transaction number / read-context version
//! - [`RankInfo`] — This process's position in the set of cooperating ranks
//! - [`IdAllocator`] — Per-container, per-class counters built on [`next_id`]

pub mod allocator;
pub mod error;
pub mod ids;
pub mod version;

pub use allocator::{next_id, try_next_id, IdAllocator, IdWatermarks, RankInfo, SequenceAllocator};
pub use error::TypeError;
pub use ids::{IdClass, ObjectClass, ObjectId, SequenceId};
pub use version::Version;
