//! Core type definitions for mpool
//!
//! This module defines the fundamental types used throughout the system:
//! object identifiers with their embedded kind tag, media classes, and the
//! property snapshots returned to clients.

use derive_more::Into;
use serde::{Deserialize, Serialize};
use std::fmt;

/// OS page size; read offsets must be multiples of this.
pub const PAGE_SIZE: u32 = 4096;

/// Number of low-order bits of an object id holding the kind tag
const KIND_BITS: u32 = 8;

/// Mask extracting the kind tag from a raw object id
const KIND_MASK: u64 = (1 << KIND_BITS) - 1;

/// The kind of object an identifier refers to
///
/// The tag is carried in the low byte of every [`ObjectId`], so the kind
/// of an identity can be established before touching any pool state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    /// Fixed-capacity, append-then-immutable storage object
    Mblock = 1,
    /// Metadata log object (reserved; not managed by this crate)
    Mlog = 2,
}

impl ObjectKind {
    /// Get the kind tag encoded into object ids
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Decode a kind tag, if valid
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Mblock),
            2 => Some(Self::Mlog),
            _ => None,
        }
    }
}

/// Unique identifier for a pool object
///
/// A 64-bit value that is never zero for a valid object: the low byte is
/// the kind tag, the remaining bits are a per-pool uniquifier assigned by
/// the object directory. Raw values crossing into the core are decoded
/// once via [`ObjectId::from_raw`] and carried strongly typed thereafter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Into)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Build an id from a non-zero uniquifier and a kind
    #[must_use]
    pub fn new(uniq: u64, kind: ObjectKind) -> Self {
        debug_assert!(uniq != 0, "object uniquifier must be non-zero");
        debug_assert!(uniq < (1 << (64 - KIND_BITS)), "object uniquifier overflow");
        Self((uniq << KIND_BITS) | u64::from(kind.tag()))
    }

    /// Decode a raw 64-bit identifier, if it carries a valid kind tag
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        ObjectKind::from_tag((raw & KIND_MASK) as u8).map(|_| Self(raw))
    }

    /// Get the raw 64-bit value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Get the kind encoded in this id
    #[must_use]
    pub fn kind(self) -> ObjectKind {
        // Only constructible with a valid tag, via new() or from_raw()
        ObjectKind::from_tag((self.0 & KIND_MASK) as u8).unwrap_or(ObjectKind::Mblock)
    }

    /// Get the per-pool uniquifier
    #[must_use]
    pub const fn uniquifier(self) -> u64 {
        self.0 >> KIND_BITS
    }

    /// Check whether this id names an mblock
    #[must_use]
    pub fn is_mblock(self) -> bool {
        self.kind() == ObjectKind::Mblock
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Test whether a raw 64-bit identifier names an mblock
///
/// True only when the value is non-zero and its kind tag is the mblock tag.
#[must_use]
pub fn is_mblock_id(raw: u64) -> bool {
    ObjectId::from_raw(raw).is_some_and(ObjectId::is_mblock)
}

/// Media class of a backing drive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaClass {
    /// Fast tier, intended for short-lived staging data
    Staging,
    /// Bulk tier, intended for long-lived data
    #[default]
    Capacity,
}

impl MediaClass {
    /// Get the on-media tag for this class
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Staging => 1,
            Self::Capacity => 2,
        }
    }

    /// Decode an on-media tag, if valid
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Staging),
            2 => Some(Self::Capacity),
            _ => None,
        }
    }
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Staging => write!(f, "staging"),
            Self::Capacity => write!(f, "capacity"),
        }
    }
}

/// Selector for looking up existing objects by identity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Find {
    /// Match regardless of lifecycle stage
    #[default]
    Any,
    /// Match only committed objects
    Committed,
    /// Match only objects still accepting appends
    Uncommitted,
}

/// Point-in-time snapshot of an mblock's metadata
///
/// A value copied out under the object's read lock; it does not alias the
/// object record and does not track later changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MblockProps {
    /// Object identifier
    pub objid: ObjectId,
    /// Bytes of capacity reserved for this object
    pub alloc_cap: u32,
    /// Bytes written so far
    pub write_len: u32,
    /// Drive-reported write alignment granularity
    pub optimal_wrsz: u32,
    /// Media class of the backing drive
    pub mclass: MediaClass,
    /// Whether the object has been committed
    pub committed: bool,
}

/// Extended mblock property snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MblockPropsEx {
    /// Common properties
    pub props: MblockProps,
    /// Number of zones backing the object
    pub zone_cnt: u32,
}

/// Space usage counters for one media class of a pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MpoolUsage {
    /// Total zones on drives of this class
    pub total_zones: u64,
    /// Zones not allocated to any object
    pub free_zones: u64,
    /// Zones held back as spares
    pub spare_zones: u64,
    /// Live mblocks on this class
    pub mblock_cnt: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objid_encoding() {
        let id = ObjectId::new(42, ObjectKind::Mblock);
        assert_eq!(id.uniquifier(), 42);
        assert_eq!(id.kind(), ObjectKind::Mblock);
        assert_eq!(id.as_u64(), (42 << 8) | 1);
    }

    #[test]
    fn test_objid_from_raw() {
        assert!(ObjectId::from_raw(0).is_none());
        assert!(ObjectId::from_raw(0x100).is_none()); // kind tag 0
        assert!(ObjectId::from_raw(0x1ff).is_none()); // kind tag out of range

        let id = ObjectId::from_raw(0x2a01).unwrap();
        assert_eq!(id.kind(), ObjectKind::Mblock);
        assert_eq!(id.uniquifier(), 0x2a);
    }

    #[test]
    fn test_is_mblock_id() {
        assert!(!is_mblock_id(0));
        assert!(is_mblock_id(ObjectId::new(1, ObjectKind::Mblock).as_u64()));
        assert!(!is_mblock_id(ObjectId::new(1, ObjectKind::Mlog).as_u64()));
        assert!(!is_mblock_id(0xabcd00));
    }

    #[test]
    fn test_objid_display() {
        let id = ObjectId::new(7, ObjectKind::Mblock);
        assert_eq!(format!("{id}"), "0x701");
        assert_eq!(format!("{id:?}"), "ObjectId(0x701)");
    }

    #[test]
    fn test_media_class_tags() {
        for mc in [MediaClass::Staging, MediaClass::Capacity] {
            assert_eq!(MediaClass::from_tag(mc.tag()), Some(mc));
        }
        assert_eq!(MediaClass::from_tag(0), None);
        assert_eq!(MediaClass::from_tag(9), None);
    }
}
