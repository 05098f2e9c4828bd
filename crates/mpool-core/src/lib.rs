//! Mpool core - storage pool and mblock engine
//!
//! This crate implements the mpool storage core:
//! - Pool drives over regular files or block devices (`pd`)
//! - On-media format: superblock and object table (`omf`)
//! - Zone extent allocation (`zone`)
//! - The mblock operation set: allocate, append, commit, read, lifecycle
//!   (`mblock`, `mpool`)
//! - Rate-limited diagnostics (`ratelimit`)
//!
//! # Mblocks
//!
//! An mblock is a fixed-capacity, append-then-immutable object. Writes
//! are strictly sequential appends to an uncommitted object; commit makes
//! the data durable and permanently read-only; reads require commit and
//! run fully concurrently. An uncommitted object can instead be aborted,
//! discarding it. Every operation is a synchronous call on the caller's
//! thread; locks are scoped to one object, so operations on distinct
//! objects never contend.

pub mod mblock;
pub mod mpool;
pub mod omf;
pub mod pd;
mod pmd;
pub mod ratelimit;
pub mod zone;

// Re-exports
pub use mblock::Mblock;
pub use mpool::Mpool;
pub use omf::{OtabEntry, Superblock};
pub use pd::{DriveAttrs, PdStats, PoolDrive};
pub use ratelimit::DiagLimiter;
pub use zone::{ZoneExtent, ZoneMap};
