//! Zone allocation
//!
//! Tracks which zones of a drive's data region are assigned to objects.
//! Uses one bit per zone: 0 = free, 1 = used. The tail of the zone range
//! above a spare watermark is reserved for spare allocations.

use mpool_common::{Error, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A contiguous run of zones assigned to one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneExtent {
    /// First zone of the run
    pub start: u64,
    /// Number of zones in the run
    pub count: u32,
}

impl ZoneExtent {
    /// Create a new extent
    #[must_use]
    pub const fn new(start: u64, count: u32) -> Self {
        Self { start, count }
    }

    /// Get the ending zone (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.count as u64
    }
}

/// Bitmap of a drive's zones
#[derive(Debug)]
pub struct ZoneMap {
    /// Bitmap data
    data: RwLock<Vec<u8>>,
    /// Total number of zones
    total: u64,
    /// Zones at or above this index are spares
    spare_base: u64,
    /// Number of free zones (cached)
    free: AtomicU64,
    /// Hint for the next free-run search in the normal region
    search_hint: AtomicU64,
}

impl ZoneMap {
    /// Create a new map with all zones free
    #[must_use]
    pub fn new(total: u64, spare_base: u64) -> Self {
        let bytes_needed = total.div_ceil(8) as usize;
        Self {
            data: RwLock::new(vec![0u8; bytes_needed]),
            total,
            spare_base: spare_base.min(total),
            free: AtomicU64::new(total),
            search_hint: AtomicU64::new(0),
        }
    }

    fn is_set_in_slice(data: &[u8], zone: u64) -> bool {
        let byte_idx = (zone / 8) as usize;
        let bit_idx = (zone % 8) as u8;
        data[byte_idx] & (1 << bit_idx) != 0
    }

    fn set_in_slice(data: &mut [u8], zone: u64) {
        let byte_idx = (zone / 8) as usize;
        let bit_idx = (zone % 8) as u8;
        data[byte_idx] |= 1 << bit_idx;
    }

    fn clear_in_slice(data: &mut [u8], zone: u64) {
        let byte_idx = (zone / 8) as usize;
        let bit_idx = (zone % 8) as u8;
        data[byte_idx] &= !(1 << bit_idx);
    }

    /// Check if a zone is allocated
    pub fn is_allocated(&self, zone: u64) -> bool {
        if zone >= self.total {
            return true; // Out of range zones are considered allocated
        }
        let data = self.data.read();
        Self::is_set_in_slice(&data, zone)
    }

    /// Allocate a contiguous extent
    ///
    /// Normal allocations search `[0, spare_base)`; spare allocations
    /// search the reserved tail `[spare_base, total)`.
    pub fn allocate(&self, count: u32, spare: bool) -> Result<ZoneExtent> {
        let needed = u64::from(count);
        if count == 0 {
            return Err(Error::internal("zero-zone extent requested"));
        }

        let mut data = self.data.write();

        let extent = if spare {
            self.find_free_run(&data, self.spare_base, self.total, needed)
        } else {
            let hint = self.search_hint.load(Ordering::Relaxed).min(self.spare_base);
            self.find_free_run(&data, hint, self.spare_base, needed)
                .or_else(|| self.find_free_run(&data, 0, hint, needed))
        };

        let Some(extent) = extent else {
            return Err(Error::InsufficientSpace {
                required: needed,
                available: self.free.load(Ordering::Relaxed),
            });
        };

        for zone in extent.start..extent.end() {
            Self::set_in_slice(&mut data, zone);
        }
        self.free.fetch_sub(needed, Ordering::Relaxed);
        if !spare {
            self.search_hint.store(extent.end(), Ordering::Relaxed);
        }

        Ok(extent)
    }

    /// Reserve a specific extent, used when rebuilding the map from the
    /// object table at pool activation
    pub fn reserve(&self, extent: ZoneExtent) -> Result<()> {
        if extent.end() > self.total {
            return Err(Error::corrupt(format!(
                "object extent {}..{} past zone count {}",
                extent.start,
                extent.end(),
                self.total
            )));
        }

        let mut data = self.data.write();
        for zone in extent.start..extent.end() {
            if Self::is_set_in_slice(&data, zone) {
                return Err(Error::corrupt(format!("zone {zone} claimed twice")));
            }
        }
        for zone in extent.start..extent.end() {
            Self::set_in_slice(&mut data, zone);
        }
        self.free.fetch_sub(u64::from(extent.count), Ordering::Relaxed);
        Ok(())
    }

    /// Free an extent
    pub fn free_extent(&self, extent: ZoneExtent) -> Result<()> {
        if extent.end() > self.total {
            return Err(Error::internal(format!(
                "freeing extent {}..{} past zone count {}",
                extent.start,
                extent.end(),
                self.total
            )));
        }

        let mut data = self.data.write();
        for zone in extent.start..extent.end() {
            if !Self::is_set_in_slice(&data, zone) {
                return Err(Error::internal(format!("zone {zone} is not allocated")));
            }
        }
        for zone in extent.start..extent.end() {
            Self::clear_in_slice(&mut data, zone);
        }
        self.free.fetch_add(u64::from(extent.count), Ordering::Relaxed);

        let hint = self.search_hint.load(Ordering::Relaxed);
        if extent.start < hint {
            self.search_hint.store(extent.start, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Find a free run of `count` zones in `[start, end)`
    fn find_free_run(&self, data: &[u8], start: u64, end: u64, count: u64) -> Option<ZoneExtent> {
        let end = end.min(self.total);
        let mut run_start = start;
        let mut run_len = 0u64;

        for zone in start..end {
            if Self::is_set_in_slice(data, zone) {
                run_start = zone + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= count {
                    return Some(ZoneExtent::new(run_start, count as u32));
                }
            }
        }

        None
    }

    /// Get the total number of zones
    pub fn total_zones(&self) -> u64 {
        self.total
    }

    /// Get the number of free zones (normal and spare regions combined)
    pub fn free_zones(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    /// Get the number of zones reserved as spares
    pub fn spare_zones(&self) -> u64 {
        self.total - self.spare_base
    }
}
