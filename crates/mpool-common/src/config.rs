//! Configuration types for mpool
//!
//! This module defines the configuration structures used when creating or
//! activating a pool.

use crate::types::{MediaClass, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for a pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MpoolConfig {
    /// Pool name
    pub name: String,
    /// Backing drives, one entry per device or file
    pub drives: Vec<DriveConfig>,
    /// Read path probe tolerance
    pub read_ahead: ReadAheadConfig,
}

impl Default for MpoolConfig {
    fn default() -> Self {
        Self {
            name: "mp0".to_string(),
            drives: vec![DriveConfig::default()],
            read_ahead: ReadAheadConfig::default(),
        }
    }
}

/// Configuration for a single backing drive
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Path to the device or regular file, resolved against the pool
    /// directory when relative
    pub path: PathBuf,
    /// Media class of this drive
    pub mclass: MediaClass,
    /// Size in bytes when creating a regular file (ignored for block
    /// devices, whose size is queried from the kernel)
    pub capacity: u64,
    /// Zone size in bytes; the allocation granularity of the data region
    pub zone_size: u32,
    /// Zones per mblock; fixes every mblock's capacity on this drive
    pub mblock_zones: u32,
    /// Write alignment granularity the drive reports to clients
    pub optimal_io_size: u32,
    /// Whether completed writes are durable without a separate flush
    pub fua: bool,
    /// Use direct I/O (O_DIRECT) on the backing file
    pub direct_io: bool,
    /// Percent of zones held back as spares
    pub spare_pct: u8,
    /// Zero-fill zones when an object is reclaimed
    pub erase_on_free: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mpool0.pd"),
            mclass: MediaClass::Capacity,
            capacity: 256 * 1024 * 1024, // 256 MB
            zone_size: 128 * 1024,       // 128 KB
            mblock_zones: 8,             // 1 MB mblocks
            optimal_io_size: PAGE_SIZE,
            fua: false,
            direct_io: false,
            spare_pct: 2,
            erase_on_free: false,
        }
    }
}

impl DriveConfig {
    /// Validate drive geometry
    ///
    /// Zone size must be a non-zero multiple of the page size, the optimal
    /// I/O size must be page-aligned and divide the zone size, and every
    /// mblock must span at least one zone.
    pub fn validate(&self) -> crate::Result<()> {
        if self.zone_size == 0 || self.zone_size % PAGE_SIZE != 0 {
            return Err(crate::Error::invalid_argument(format!(
                "zone size {} is not a multiple of the page size",
                self.zone_size
            )));
        }
        if self.optimal_io_size == 0
            || self.optimal_io_size % PAGE_SIZE != 0
            || self.zone_size % self.optimal_io_size != 0
        {
            return Err(crate::Error::invalid_argument(format!(
                "optimal I/O size {} does not divide zone size {}",
                self.optimal_io_size, self.zone_size
            )));
        }
        if self.mblock_zones == 0 {
            return Err(crate::Error::invalid_argument(
                "mblocks must span at least one zone",
            ));
        }
        if self
            .mblock_zones
            .checked_mul(self.zone_size)
            .is_none()
        {
            return Err(crate::Error::invalid_argument(format!(
                "mblock capacity {}x{} overflows",
                self.mblock_zones, self.zone_size
            )));
        }
        if self.spare_pct > 50 {
            return Err(crate::Error::invalid_argument(format!(
                "spare percentage {} exceeds 50",
                self.spare_pct
            )));
        }
        Ok(())
    }
}

/// Read path probe tolerance
///
/// A committed read whose end falls at most `max_probe` bytes past the
/// written length is clamped to the written length instead of failing;
/// this accommodates speculative prefetch by a caching layer above. Zero
/// disables the allowance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReadAheadConfig {
    /// Maximum bytes a read may extend past the written length
    pub max_probe: u32,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            max_probe: 128 * 1024, // 128 KB
        }
    }
}
